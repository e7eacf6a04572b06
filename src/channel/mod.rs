// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Length-prefixed framing over a duplex byte stream (a worker's stdio pipes).

mod frame;

pub use frame::{Channel, HEADER_LEN};
