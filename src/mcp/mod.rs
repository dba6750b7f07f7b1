// Copyright 2026 BadCompany
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Model Context Protocol (MCP) implementation.
//!
//! This module handles the protocol-specific logic: framing, transports,
//! process management, the client, the server dispatcher and the
//! filesystem notification bridge.

pub mod bridge;
pub mod catalog;
pub mod client;
pub mod codec;
pub mod dispatcher;
pub mod executor;
pub mod pipeline;
pub mod process;
pub mod server;
pub mod transport;
