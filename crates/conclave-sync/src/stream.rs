//! Live message stream.

use futures::stream::BoxStream;
use futures::{future, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use conclave_core::RawMessage;

use crate::error::Result;
use crate::transport::Conversation;

/// Live messages in delivery order. Ends on cancellation or on the first
/// transport error.
pub type LiveStream = BoxStream<'static, RawMessage>;

/// Opens live streams. Cancelling the token releases the underlying
/// network subscription.
pub struct LiveStreamReader;

impl LiveStreamReader {
    pub async fn open<V: Conversation>(
        conversation: &V,
        cancel: CancellationToken,
    ) -> Result<LiveStream> {
        let inner = conversation.stream_messages().await?;
        let conversation_id = conversation.id().to_string();
        debug!(conversation = %conversation_id, "live stream opened");

        Ok(inner
            .take_until(cancel.cancelled_owned())
            .scan(conversation_id, |conversation_id, item| {
                future::ready(match item {
                    Ok(message) => Some(message),
                    Err(e) => {
                        warn!(
                            conversation = %conversation_id,
                            error = %e,
                            "live stream failed"
                        );
                        None
                    }
                })
            })
            .boxed())
    }
}
