// Regulatory filings: annual vs quarterly, plus the validity gate.

use super::{StagingRecord, TransformContext, TransformOutput};
use crate::record::{ScoredRecord, Value};

pub const ANNUAL: &str = "annual";
pub const QUARTERLY: &str = "quarterly";

pub fn transform(raw: &[ScoredRecord], ctx: &TransformContext) -> TransformOutput {
    let mut output = TransformOutput::default();
    for row in raw {
        let mut staged = StagingRecord::from_raw(row);

        let period = staged.get("fiscal_period").and_then(Value::as_str);
        let frequency = if period == Some(ctx.annual_sentinel.as_str()) {
            ANNUAL
        } else {
            QUARTERLY
        };
        staged.set("reporting_frequency", Value::text(frequency));

        let valid = is_valid(&staged);
        output.push(staged, valid);
    }
    output
}

/// value, period_end and fiscal_year present
pub fn is_valid(row: &StagingRecord) -> bool {
    ["value", "period_end", "fiscal_year"]
        .iter()
        .all(|f| row.get(f).is_some())
}
