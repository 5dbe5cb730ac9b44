use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    /// Connection-class failure: the bus is unreachable or the link dropped.
    /// These feed the bridge's circuit breaker.
    #[error("bus connection failure: {0}")]
    Connection(String),

    /// The command reached the bus but failed (bad reply, wrong type, ...).
    #[error("bus command failed: {0}")]
    Command(String),

    /// Deliberate fast-fail while the circuit is open.
    #[error("bus circuit open")]
    CircuitOpen,
}

impl BusError {
    /// Connection-class errors trip the circuit; command errors do not.
    #[must_use]
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::CircuitOpen)
    }
}

impl From<redis::RedisError> for BusError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error()
            || e.is_connection_refusal()
            || e.is_connection_dropped()
            || e.is_timeout()
        {
            Self::Connection(e.to_string())
        } else {
            Self::Command(e.to_string())
        }
    }
}

pub type BusResult<T> = Result<T, BusError>;
