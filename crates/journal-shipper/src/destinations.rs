// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Remembers which log groups and streams exist and the last sequence token
//! of each stream, so creation calls are made once per process.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::cloudwatch::{ApiError, LogsApi};
use crate::routing::Destination;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    /// Stream exists; `None` means no append has happened yet.
    Ready(Option<String>),
    /// Stream exists but the cached token is known to be wrong.
    Stale,
}

#[derive(Debug, Default)]
struct State {
    groups: HashSet<String>,
    streams: HashMap<Destination, Entry>,
}

pub struct DestinationCache {
    api: Arc<dyn LogsApi>,
    state: Mutex<State>,
}

impl DestinationCache {
    pub fn new(api: Arc<dyn LogsApi>) -> Self {
        Self {
            api,
            state: Mutex::new(State::default()),
        }
    }

    // Never held across an await.
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes sure the destination exists and returns the token to use for
    /// the next append to it.
    pub async fn ensure(&self, destination: &Destination) -> Result<Option<String>, ApiError> {
        let (cached, group_known) = {
            let state = self.state();
            (
                state.streams.get(destination).cloned(),
                state.groups.contains(&destination.group),
            )
        };

        let token = match cached {
            Some(Entry::Ready(token)) => return Ok(token),
            Some(Entry::Stale) => self.api.describe_sequence_token(&destination.group, &destination.stream).await?,
            None => {
                if !group_known {
                    self.create_group(&destination.group).await?;
                }
                self.create_stream(destination).await?
            }
        };

        self.update(destination, token.clone());
        Ok(token)
    }

    async fn create_group(&self, group: &str) -> Result<(), ApiError> {
        match self.api.create_log_group(group).await {
            Ok(()) => debug!("CLOUDWATCH | Created log group {group}"),
            Err(ApiError::AlreadyExists) => {}
            Err(e) => return Err(e),
        }
        self.state().groups.insert(group.to_string());
        Ok(())
    }

    /// Creates the stream; an existing stream is looked up for its token.
    async fn create_stream(&self, destination: &Destination) -> Result<Option<String>, ApiError> {
        match self
            .api
            .create_log_stream(&destination.group, &destination.stream)
            .await
        {
            Ok(()) => {
                debug!("CLOUDWATCH | Created log stream {destination}");
                Ok(None)
            }
            Err(ApiError::AlreadyExists) => {
                self.api
                    .describe_sequence_token(&destination.group, &destination.stream)
                    .await
            }
            Err(ApiError::ResourceNotFound(message)) => {
                // The group went away since we last saw it.
                self.state().groups.remove(&destination.group);
                Err(ApiError::ResourceNotFound(message))
            }
            Err(e) => Err(e),
        }
    }

    /// Records the token returned by a successful append.
    pub fn update(&self, destination: &Destination, token: Option<String>) {
        self.state()
            .streams
            .insert(destination.clone(), Entry::Ready(token));
    }

    /// Forces the next [`ensure`](Self::ensure) to fetch the token again.
    pub fn invalidate(&self, destination: &Destination) {
        if let Some(entry) = self.state().streams.get_mut(destination) {
            *entry = Entry::Stale;
        }
    }

    /// Forgets the destination entirely so it is created again.
    pub fn forget(&self, destination: &Destination) {
        let mut state = self.state();
        state.streams.remove(destination);
        state.groups.remove(&destination.group);
    }

    pub fn cached_token(&self, destination: &Destination) -> Option<Option<String>> {
        match self.state().streams.get(destination) {
            Some(Entry::Ready(token)) => Some(token.clone()),
            _ => None,
        }
    }
}
