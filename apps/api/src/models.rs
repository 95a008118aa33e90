use std::collections::BTreeMap;

use serde::Deserialize;

/// Ingest body. The required fields are validated by the handler so that
/// missing input produces the standard error envelope.
#[derive(Debug, Deserialize)]
pub struct LogRecordIn {
    pub id: Option<String>,
    pub timestamp: Option<String>,
    pub source: Option<String>,
    pub level: Option<String>,
    pub message: Option<String>,
    pub metadata: Option<BTreeMap<String, String>>,
    pub stacktrace: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub source: Option<String>,
    pub level: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BatchSubmitIn {
    pub batch_size: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}
