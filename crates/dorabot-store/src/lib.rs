// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod db;
mod event_log;
mod sessions;

pub use db::{Store, StoreError};
pub use event_log::{Cursor, StreamEvent, StreamEventKind};
pub use sessions::SessionRow;

pub type Result<T> = std::result::Result<T, StoreError>;
