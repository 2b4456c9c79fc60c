//! Local table clients: JSON-lines dumps on disk and an in-memory table set.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use chatlake_shared::{ChatlakeError, Result};

use crate::attr::RawItem;
use crate::{KeyValueSource, PageToken, ScanPage};

/// Reads `<dir>/<table>.jsonl`, one item per line, in pages of `page_size`.
///
/// Page tokens are item offsets. Each page re-reads the dump so a scan always
/// observes the file as it is when the page is requested.
#[derive(Debug, Clone)]
pub struct JsonlTableSource {
    dir: PathBuf,
    page_size: usize,
}

impl JsonlTableSource {
    pub fn new(dir: impl Into<PathBuf>, page_size: usize) -> Self {
        Self {
            dir: dir.into(),
            page_size: page_size.max(1),
        }
    }

    fn table_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{table}.jsonl"))
    }
}

#[async_trait]
impl KeyValueSource for JsonlTableSource {
    async fn scan_page(&self, table: &str, start: Option<&PageToken>) -> Result<ScanPage> {
        let path = self.table_path(table);
        let offset = parse_offset(start)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ChatlakeError::SourceUnavailable(format!("{}: {e}", path.display())))?;

        let mut items = Vec::with_capacity(self.page_size);
        let mut lines = content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .skip(offset);

        for (line_no, line) in lines.by_ref().take(self.page_size) {
            items.push(parse_line(&path, line_no + 1, line)?);
        }
        let next = lines
            .next()
            .map(|_| PageToken((offset + items.len()).to_string()));

        Ok(ScanPage { items, next })
    }
}

fn parse_offset(start: Option<&PageToken>) -> Result<usize> {
    match start {
        None => Ok(0),
        Some(PageToken(raw)) => raw
            .parse()
            .map_err(|_| ChatlakeError::validation(format!("invalid page token '{raw}'"))),
    }
}

fn parse_line(path: &Path, line_no: usize, line: &str) -> Result<RawItem> {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ChatlakeError::SourceUnavailable(format!(
            "{}:{line_no}: item is not a JSON object",
            path.display()
        ))),
        Err(e) => Err(ChatlakeError::SourceUnavailable(format!(
            "{}:{line_no}: {e}",
            path.display()
        ))),
    }
}

/// In-memory tables, paginated like a real store.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    tables: HashMap<String, Vec<RawItem>>,
    page_size: usize,
}

impl MemorySource {
    pub fn new(page_size: usize) -> Self {
        Self {
            tables: HashMap::new(),
            page_size: page_size.max(1),
        }
    }

    pub fn with_table(mut self, table: impl Into<String>, items: Vec<RawItem>) -> Self {
        self.tables.insert(table.into(), items);
        self
    }
}

#[async_trait]
impl KeyValueSource for MemorySource {
    async fn scan_page(&self, table: &str, start: Option<&PageToken>) -> Result<ScanPage> {
        let items = self
            .tables
            .get(table)
            .ok_or_else(|| ChatlakeError::SourceUnavailable(format!("no such table: {table}")))?;
        let offset = parse_offset(start)?;
        let end = (offset + self.page_size).min(items.len());
        let page = items.get(offset..end).map(<[RawItem]>::to_vec).unwrap_or_default();
        let next = (end < items.len()).then(|| PageToken(end.to_string()));
        Ok(ScanPage { items: page, next })
    }
}
