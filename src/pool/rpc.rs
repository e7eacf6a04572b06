// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Positional-argument request envelope carried as a frame payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    pub args: Vec<Value>,
}

/// Reply envelope carried as a frame payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcReply {
    pub r: Value,
}

impl RpcRequest {
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

impl RpcReply {
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
