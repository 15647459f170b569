use anyhow::Result;

#[cfg_attr(test, mockall::automock)]
pub trait NicTest: Send + Sync {
    /// Transmit one probe frame once the receiver has signalled readiness.
    /// Fatal on desynchronization or a send failure.
    fn send(&self) -> Result<()>;

    /// Wait for and consume one frame plus its timestamp metadata.
    /// Returns Ok(true) if a frame was received, Ok(false) on a transient
    /// miss (poll timeout or recoverable receive error).
    fn receive(&self) -> Result<bool>;
}
