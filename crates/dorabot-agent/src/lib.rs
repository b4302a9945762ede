// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod events;
mod mock;
mod producer;

pub use events::{ErrorKind, ProducerEvent, ToolDecision};
pub use mock::{EchoProducer, MockProducer, ScriptStep};
pub use producer::{AgentProducer, ProducerRun, UserTurn};
