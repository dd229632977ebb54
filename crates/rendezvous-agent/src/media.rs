use async_trait::async_trait;
use tracing::{info, warn};

use crate::engine::RemoteStream;
use crate::error::{MediaError, NegotiationError};

/// Source of the local stream offered to the peer.
#[async_trait]
pub trait MediaSource: Send + Sync {
    type Stream: Send;

    async fn acquire(&self) -> Result<Self::Stream, MediaError>;
}

/// Sink for remote media.
pub trait Playback: Send + Sync {
    fn attach(&self, stream: &RemoteStream);
    fn detach(&self);
}

/// Playback that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPlayback;

impl Playback for NoPlayback {
    fn attach(&self, _stream: &RemoteStream) {}
    fn detach(&self) {}
}

/// Acquires the local stream. Failing to get one never stops a negotiation:
/// the session simply carries no outgoing media.
pub async fn acquire_local_media<S: MediaSource + ?Sized>(source: &S) -> Option<S::Stream> {
    match source.acquire().await {
        Ok(stream) => {
            info!(target = "rendezvous::media", "local stream acquired");
            Some(stream)
        }
        Err(MediaError::Denied) => {
            warn!(
                target = "rendezvous::media",
                error = %NegotiationError::UserDenied,
                "no local stream, continuing without media"
            );
            None
        }
        Err(err) => {
            warn!(
                target = "rendezvous::media",
                error = %err,
                "no local stream, continuing without media"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Result<u8, MediaError>);

    #[async_trait]
    impl MediaSource for Fixed {
        type Stream = u8;

        async fn acquire(&self) -> Result<u8, MediaError> {
            self.0.clone()
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn media_failures_are_not_fatal() {
        assert_eq!(acquire_local_media(&Fixed(Ok(3))).await, Some(3));
        assert_eq!(acquire_local_media(&Fixed(Err(MediaError::Denied))).await, None);
        assert_eq!(
            acquire_local_media(&Fixed(Err(MediaError::Unavailable))).await,
            None
        );
    }
}
