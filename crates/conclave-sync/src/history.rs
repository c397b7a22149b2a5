//! Paginated history.
//!
//! Pages are requested newest-first and walk backwards in time. The cursor
//! holds the send time of the oldest message seen so far together with the
//! ids already returned at that time. The next page re-reads that timestamp
//! and skips those ids, so messages sharing a timestamp across a page
//! boundary are never lost.

use std::collections::HashSet;

use conclave_core::{MessageId, RawMessage};
use tracing::debug;

use crate::error::Result;
use crate::transport::{Conversation, MessageQuery};

/// Position of the oldest message returned so far.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor {
    /// Inclusive upper bound (Unix ns) for the next page.
    pub sent_at_ns: i64,
    /// Messages at `sent_at_ns` that were already returned.
    pub seen: Vec<MessageId>,
}

impl Cursor {
    pub fn at(sent_at_ns: i64) -> Self {
        Self {
            sent_at_ns,
            seen: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// `None` requests the newest page.
    pub before: Option<Cursor>,
    pub page_size: usize,
}

impl PageRequest {
    pub fn newest(page_size: usize) -> Self {
        Self {
            before: None,
            page_size,
        }
    }
}

/// One page of history, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryPage {
    pub records: Vec<RawMessage>,
    /// Cursor for the following page. Unchanged from the request when the
    /// page is empty.
    pub oldest_cursor: Option<Cursor>,
    /// A full page suggests there may be more. A short page means the start
    /// of the conversation was reached.
    pub has_more: bool,
}

/// Loads history pages from a resolved conversation.
pub struct HistoryLoader<V: Conversation> {
    conversation: V,
}

impl<V: Conversation> HistoryLoader<V> {
    pub fn new(conversation: V) -> Self {
        Self { conversation }
    }

    pub async fn load_page(&self, request: PageRequest) -> Result<HistoryPage> {
        if request.page_size == 0 {
            return Ok(HistoryPage {
                records: Vec::new(),
                oldest_cursor: request.before,
                has_more: false,
            });
        }

        // Re-read the boundary timestamp; the overlap is filtered out below.
        let (sent_before_ns, overlap) = match &request.before {
            Some(cursor) => (Some(cursor.sent_at_ns.saturating_add(1)), cursor.seen.len()),
            None => (None, 0),
        };
        let limit = request.page_size.saturating_add(overlap);

        let fetched = self
            .conversation
            .list_messages(&MessageQuery {
                sent_before_ns,
                limit,
            })
            .await?;
        let has_more = fetched.len() >= limit;

        let already: HashSet<&MessageId> = request
            .before
            .iter()
            .flat_map(|c| c.seen.iter())
            .collect();
        let mut records: Vec<RawMessage> = fetched
            .into_iter()
            .filter(|m| !already.contains(&m.id))
            .collect();
        records.truncate(request.page_size);

        let oldest_cursor = match records.iter().map(|m| m.sent_at_ns).min() {
            Some(oldest) => {
                let mut seen: Vec<MessageId> = records
                    .iter()
                    .filter(|m| m.sent_at_ns == oldest)
                    .map(|m| m.id.clone())
                    .collect();
                if let Some(previous) = request.before.as_ref().filter(|c| c.sent_at_ns == oldest) {
                    seen.extend(previous.seen.iter().cloned());
                }
                Some(Cursor {
                    sent_at_ns: oldest,
                    seen,
                })
            }
            None => request.before.clone(),
        };
        records.sort_by_key(|m| m.sent_at_ns);

        debug!(
            conversation = self.conversation.id(),
            count = records.len(),
            has_more,
            "history page loaded"
        );

        Ok(HistoryPage {
            records,
            oldest_cursor,
            has_more,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Connector;
    use crate::test_support::TestSigner;
    use crate::transport::memory::{MemoryConversation, MemoryNetwork};
    use crate::transport::MessagingClient;
    use conclave_core::Address;
    use std::sync::Arc;

    async fn seeded(count: i64) -> (Arc<MemoryNetwork>, MemoryConversation) {
        let network = MemoryNetwork::new();
        let me = Address::new("0xme");
        network.create_conversation("g", &[me.clone()]);
        for at in 1..=count {
            network.post_at("g", &me, at, &format!("m{at}")).unwrap();
        }
        let client = network.connector().connect(&TestSigner::new("0xme")).await.unwrap();
        let conversation = client.find_conversation("g").await.unwrap().unwrap();
        (network, conversation)
    }

    #[tokio::test]
    async fn test_two_pages_cover_history() {
        let (_network, conversation) = seeded(140).await;
        let loader = HistoryLoader::new(conversation);

        let first = loader.load_page(PageRequest::newest(100)).await.unwrap();
        assert_eq!(first.records.len(), 100);
        assert!(first.has_more);
        assert_eq!(first.oldest_cursor.as_ref().map(|c| c.sent_at_ns), Some(41));
        assert_eq!(first.records.first().unwrap().sent_at_ns, 41);
        assert_eq!(first.records.last().unwrap().sent_at_ns, 140);

        let second = loader
            .load_page(PageRequest {
                before: first.oldest_cursor,
                page_size: 100,
            })
            .await
            .unwrap();
        assert_eq!(second.records.len(), 40);
        assert!(!second.has_more);
        assert_eq!(second.records.last().unwrap().sent_at_ns, 40);
        assert_eq!(second.oldest_cursor.map(|c| c.sent_at_ns), Some(1));
    }

    #[tokio::test]
    async fn test_empty_page_keeps_cursor() {
        let (_network, conversation) = seeded(3).await;
        let loader = HistoryLoader::new(conversation);

        let page = loader
            .load_page(PageRequest {
                before: Some(Cursor {
                    sent_at_ns: 1,
                    seen: vec![MessageId::new("msg-1")],
                }),
                page_size: 10,
            })
            .await
            .unwrap();
        assert!(page.records.is_empty());
        assert!(!page.has_more);
        assert_eq!(page.oldest_cursor.map(|c| c.sent_at_ns), Some(1));
    }

    async fn connect(network: &Arc<MemoryNetwork>) -> MemoryConversation {
        let client = network.connector().connect(&TestSigner::new("0xme")).await.unwrap();
        client.find_conversation("g").await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_ties_across_page_boundary() {
        let network = MemoryNetwork::new();
        let me = Address::new("0xme");
        network.create_conversation("g", &[me.clone()]);
        for at in [1, 1, 2] {
            network.post_at("g", &me, at, "tie").unwrap();
        }
        let loader = HistoryLoader::new(connect(&network).await);

        let first = loader.load_page(PageRequest::newest(2)).await.unwrap();
        assert_eq!(first.records.len(), 2);
        assert!(first.has_more);

        let second = loader
            .load_page(PageRequest {
                before: first.oldest_cursor.clone(),
                page_size: 2,
            })
            .await
            .unwrap();
        assert!(!second.has_more);

        let ids: HashSet<MessageId> = first
            .records
            .iter()
            .chain(&second.records)
            .map(|m| m.id.clone())
            .collect();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn test_more_ties_than_page_size() {
        let network = MemoryNetwork::new();
        let me = Address::new("0xme");
        network.create_conversation("g", &[me.clone()]);
        for _ in 0..3 {
            network.post_at("g", &me, 5, "same instant").unwrap();
        }
        network.post_at("g", &me, 4, "earlier").unwrap();
        let loader = HistoryLoader::new(connect(&network).await);

        let mut ids = HashSet::new();
        let mut request = PageRequest::newest(1);
        for _ in 0..10 {
            let page = loader.load_page(request.clone()).await.unwrap();
            ids.extend(page.records.iter().map(|m| m.id.clone()));
            if !page.has_more {
                break;
            }
            request.before = page.oldest_cursor;
        }
        assert_eq!(ids.len(), 4);
    }

    #[tokio::test]
    async fn test_zero_page_size() {
        let (_network, conversation) = seeded(3).await;
        let page = HistoryLoader::new(conversation)
            .load_page(PageRequest::newest(0))
            .await
            .unwrap();
        assert!(page.records.is_empty());
        assert!(!page.has_more);
    }
}
