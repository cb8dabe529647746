// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ships systemd journal entries to CloudWatch Logs.
//!
//! Entries are read in order from a [`journal::JournalSource`], routed to a
//! log group and stream by rendering two [`format::Template`]s against the
//! entry's fields, batched per destination and appended with
//! `PutLogEvents`. The journal cursor is persisted only once every entry up
//! to it has been accepted, so a restart never loses an entry, at the cost of
//! possibly sending some twice.
//!
//! - [`format`]: template parsing and rendering
//! - [`routing`] and [`fields`]: per-entry destination resolution
//! - [`batcher`], [`uploader`], [`destinations`]: batching and delivery
//! - [`cloudwatch`]: the ingestion API client
//! - [`cursor`], [`journal`], [`tailer`]: reading and resuming

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batcher;
pub mod cloudwatch;
pub mod config;
pub mod cursor;
pub mod destinations;
pub mod error;
pub mod fields;
pub mod format;
pub mod http;
pub mod journal;
pub mod metadata;
pub mod routing;
pub mod tailer;
pub mod uploader;
