//! Multi-source date combination.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// How candidate dates from several sources merge into one
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CombinePolicy {
    #[default]
    Earliest,
    Latest,
}

/// Combine nullable dates. `None` inputs are absent values, not extremes;
/// the result is `None` only when every input is `None`.
pub fn combine<I>(dates: I, policy: CombinePolicy) -> Option<NaiveDate>
where
    I: IntoIterator<Item = Option<NaiveDate>>,
{
    let present = dates.into_iter().flatten();
    match policy {
        CombinePolicy::Earliest => present.min(),
        CombinePolicy::Latest => present.max(),
    }
}
