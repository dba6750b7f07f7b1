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

//! lilith-mcp: a Model Context Protocol stack.
//!
//! The client side reaches a tool/resource/prompt provider over stdio, HTTP
//! or SSE and correlates responses with timeouts. The server side dispatches
//! JSON-RPC requests against registries and turns filesystem changes into
//! debounced change notifications.

pub mod config;
pub mod engine_core;
pub mod mcp;
pub mod protocol;
pub mod utils;

pub use config::Config;
pub use engine_core::errors::{McpError, McpResult};
pub use mcp::client::{ClientOptions, EnhancedClient};
pub use mcp::dispatcher::Dispatcher;
pub use mcp::transport::{create_transport, Transport, TransportConfig};
