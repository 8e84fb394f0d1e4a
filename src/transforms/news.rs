// News: headline sentiment plus a recency window relative to `as_of`.

use super::{StagingRecord, TransformContext, TransformOutput};
use crate::record::{ScoredRecord, Value};
use chrono::{DateTime, Utc};

const ENTITY: &str = "news";

pub fn transform(raw: &[ScoredRecord], ctx: &TransformContext) -> TransformOutput {
    let cutoff = ctx.recency_cutoff(ENTITY);

    let mut output = TransformOutput::default();
    for row in raw {
        let mut staged = StagingRecord::from_raw(row);

        let title = staged.get("title").and_then(Value::as_str).unwrap_or_default();
        let sentiment = ctx.sentiment.classify(title);
        staged.set("sentiment", Value::text(sentiment.as_str()));

        let valid = is_valid(&staged, &cutoff);
        output.push(staged, valid);
    }
    output
}

/// title, url and published_at present; published no earlier than `cutoff`
pub fn is_valid(row: &StagingRecord, cutoff: &DateTime<Utc>) -> bool {
    let published = row.get("published_at").and_then(Value::watermark);
    row.get("title").is_some()
        && row.get("url").is_some()
        && matches!(published, Some(at) if at >= *cutoff)
}
