//! Record Extractor: paginated full scans over a key-value table.
//!
//! The store itself sits behind the [`KeyValueSource`] capability and returns
//! bounded pages. [`Scanner`] hides the pagination so callers see one
//! continuous, lazily fetched sequence of decoded items. A scan is restartable
//! per invocation but never resumed across invocations.

mod attr;
mod item;
mod jsonl;

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::Stream;
use tracing::debug;

use chatlake_shared::{ChatlakeError, Result};

pub use attr::{RawItem, decode_item, decode_value};
pub use item::{ItemKind, ParsedItem, item_key, parse_item, parse_timestamp};
pub use jsonl::{JsonlTableSource, MemorySource};

/// Opaque continuation token returned with a non-final page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageToken(pub String);

/// One bounded page of raw items.
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub items: Vec<RawItem>,
    /// `None` on the last page.
    pub next: Option<PageToken>,
}

/// Read capability of the key-value store.
///
/// Implementations own their retry policy; an unreachable store is reported
/// as [`chatlake_shared::ChatlakeError::SourceUnavailable`] once that budget
/// is spent.
#[async_trait]
pub trait KeyValueSource: Send + Sync {
    /// Fetch the page starting at `start` (the first page when `None`).
    async fn scan_page(&self, table: &str, start: Option<&PageToken>) -> Result<ScanPage>;
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

/// Lazy full scan of one table.
pub struct Scanner<'a> {
    source: &'a dyn KeyValueSource,
    table: String,
    buffer: VecDeque<RawItem>,
    next: Option<PageToken>,
    exhausted: bool,
    pages: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(source: &'a dyn KeyValueSource, table: impl Into<String>) -> Self {
        Self {
            source,
            table: table.into(),
            buffer: VecDeque::new(),
            next: None,
            exhausted: false,
            pages: 0,
        }
    }

    /// Next decoded item, fetching further pages as needed.
    pub async fn next_item(&mut self) -> Result<Option<RawItem>> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Ok(Some(decode_item(item)));
            }
            if self.exhausted {
                return Ok(None);
            }

            let page = self
                .source
                .scan_page(&self.table, self.next.as_ref())
                .await?;
            self.pages += 1;
            debug!(
                table = %self.table,
                page = self.pages,
                items = page.items.len(),
                "fetched scan page"
            );
            self.buffer.extend(page.items);
            self.exhausted = page.next.is_none();
            self.next = page.next;
        }
    }

    /// Pages fetched so far.
    pub fn pages(&self) -> usize {
        self.pages
    }
}

/// Full scan of `table` as a stream of decoded items.
pub fn scan<'a>(
    source: &'a dyn KeyValueSource,
    table: &str,
) -> impl Stream<Item = Result<RawItem>> + 'a {
    futures::stream::try_unfold(Scanner::new(source, table), |mut scanner| async move {
        let next = scanner.next_item().await?;
        Ok::<_, ChatlakeError>(next.map(|item| (item, scanner)))
    })
}

/// Collect a full scan into memory.
pub async fn scan_all(source: &dyn KeyValueSource, table: &str) -> Result<Vec<RawItem>> {
    let mut scanner = Scanner::new(source, table);
    let mut items = Vec::new();
    while let Some(item) = scanner.next_item().await? {
        items.push(item);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde_json::json;

    fn items(n: usize) -> Vec<RawItem> {
        (0..n)
            .map(|i| {
                json!({"PK": {"S": format!("USER#{i}")}, "SK": {"S": "REGISTER"}})
                    .as_object()
                    .cloned()
                    .unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn scanner_crosses_page_boundaries() {
        let source = MemorySource::new(3).with_table("t", items(7));
        let mut scanner = Scanner::new(&source, "t");
        let mut seen = Vec::new();
        while let Some(item) = scanner.next_item().await.unwrap() {
            seen.push(item["PK"].as_str().unwrap().to_string());
        }
        assert_eq!(seen.len(), 7);
        assert_eq!(seen[0], "USER#0");
        assert_eq!(seen[6], "USER#6");
        assert_eq!(scanner.pages(), 3);
    }

    #[tokio::test]
    async fn stream_yields_every_item_once() {
        let source = MemorySource::new(2).with_table("t", items(5));
        let collected: Vec<RawItem> = scan(&source, "t").try_collect().await.unwrap();
        assert_eq!(collected.len(), 5);
    }

    #[tokio::test]
    async fn empty_table_yields_nothing() {
        let source = MemorySource::new(10).with_table("t", Vec::new());
        assert!(scan_all(&source, "t").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unavailable_source_propagates() {
        let source = MemorySource::new(10);
        let err = scan_all(&source, "missing").await.unwrap_err();
        assert!(matches!(err, ChatlakeError::SourceUnavailable(_)));
    }
}
