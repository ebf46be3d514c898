//! Tunnel configuration, read once at startup and handed to each component.

use crate::codec::{Compression, DEFAULT_COMPRESS_THRESHOLD};
use crate::ensure;
use serde::{Deserialize, Deserializer};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    max_chunk_size: usize,
    compression: Option<Compression>,
    compress_threshold: usize,
    call_deadline: Duration,
    sweep_interval: Duration,
    max_in_flight: usize,
    max_message_bytes: usize,
    idle_timeout: Duration,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_chunk_size must be greater than 0")]
    ZeroChunkSize,

    #[error("max_in_flight must be greater than 0")]
    ZeroInFlight,

    #[error("max_message_bytes {max_message_bytes} is smaller than max_chunk_size {max_chunk_size}")]
    MessageSmallerThanChunk { max_message_bytes: usize, max_chunk_size: usize },

    #[error("sweep_interval {sweep_interval:?} must be non zero and smaller than call_deadline {call_deadline:?}")]
    SweepInterval { sweep_interval: Duration, call_deadline: Duration },
}

impl TunnelConfig {
    pub fn builder() -> TunnelConfigBuilder {
        TunnelConfigBuilder::default()
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    pub fn compression(&self) -> Option<Compression> {
        self.compression
    }

    pub fn compress_threshold(&self) -> usize {
        self.compress_threshold
    }

    /// Deadline of one tunneled call, from send to the last reply chunk
    pub fn call_deadline(&self) -> Duration {
        self.call_deadline
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        let builder = TunnelConfigBuilder::default();
        Self {
            max_chunk_size: builder.max_chunk_size,
            compression: builder.compression,
            compress_threshold: builder.compress_threshold,
            call_deadline: builder.call_deadline,
            sweep_interval: builder.sweep_interval,
            max_in_flight: builder.max_in_flight,
            max_message_bytes: builder.max_message_bytes,
            idle_timeout: builder.idle_timeout,
        }
    }
}

/// Builder of [`TunnelConfig`]; also deserializable so it can be read from a file, durations in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TunnelConfigBuilder {
    max_chunk_size: usize,
    compression: Option<Compression>,
    compress_threshold: usize,
    #[serde(deserialize_with = "millis")]
    call_deadline: Duration,
    #[serde(deserialize_with = "millis")]
    sweep_interval: Duration,
    max_in_flight: usize,
    max_message_bytes: usize,
    #[serde(deserialize_with = "millis")]
    idle_timeout: Duration,
}

impl Default for TunnelConfigBuilder {
    fn default() -> Self {
        Self {
            max_chunk_size: 64 * 1024,
            compression: Some(Compression::Gzip),
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
            call_deadline: Duration::from_secs(30),
            sweep_interval: Duration::from_millis(100),
            max_in_flight: 1024,
            max_message_bytes: 64 * 1024 * 1024,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl TunnelConfigBuilder {
    pub fn max_chunk_size(mut self, max_chunk_size: usize) -> Self {
        self.max_chunk_size = max_chunk_size;
        self
    }

    pub fn compression(mut self, compression: Option<Compression>) -> Self {
        self.compression = compression;
        self
    }

    pub fn compress_threshold(mut self, compress_threshold: usize) -> Self {
        self.compress_threshold = compress_threshold;
        self
    }

    pub fn call_deadline(mut self, call_deadline: Duration) -> Self {
        self.call_deadline = call_deadline;
        self
    }

    pub fn sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    pub fn max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub fn max_message_bytes(mut self, max_message_bytes: usize) -> Self {
        self.max_message_bytes = max_message_bytes;
        self
    }

    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn build(self) -> Result<TunnelConfig, ConfigError> {
        ensure!(self.max_chunk_size > 0, ConfigError::ZeroChunkSize);
        ensure!(self.max_in_flight > 0, ConfigError::ZeroInFlight);
        ensure!(
            self.max_message_bytes >= self.max_chunk_size,
            ConfigError::MessageSmallerThanChunk {
                max_message_bytes: self.max_message_bytes,
                max_chunk_size: self.max_chunk_size
            }
        );
        // the sweep is what fires timeouts, it must tick faster than the shortest deadline
        ensure!(
            !self.sweep_interval.is_zero() && self.sweep_interval < self.call_deadline,
            ConfigError::SweepInterval { sweep_interval: self.sweep_interval, call_deadline: self.call_deadline }
        );

        Ok(TunnelConfig {
            max_chunk_size: self.max_chunk_size,
            compression: self.compression,
            compress_threshold: self.compress_threshold,
            call_deadline: self.call_deadline,
            sweep_interval: self.sweep_interval,
            max_in_flight: self.max_in_flight,
            max_message_bytes: self.max_message_bytes,
            idle_timeout: self.idle_timeout,
        })
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}
