// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{future::Future, pin::Pin};

use serde_json::Value;

/// The work function `f` that every worker process (or, for a degenerate
/// zero-worker pool, the submitter itself) applies to a request.
pub trait Job: Send + Sync {
    fn run<'a>(
        &'a self,
        args: Value,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send + 'a>>;
}
