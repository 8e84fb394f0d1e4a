// Fundamentals: no derived columns, only the validity gate.

use super::{gte, StagingRecord, TransformContext, TransformOutput};
use crate::record::ScoredRecord;

pub fn transform(raw: &[ScoredRecord], _ctx: &TransformContext) -> TransformOutput {
    let mut output = TransformOutput::default();
    for row in raw {
        let staged = StagingRecord::from_raw(row);
        let valid = is_valid(&staged);
        output.push(staged, valid);
    }
    output
}

/// revenue and market_cap present, revenue >= 0
pub fn is_valid(row: &StagingRecord) -> bool {
    row.get("market_cap").is_some() && gte(row.number("revenue"), Some(0.0))
}
