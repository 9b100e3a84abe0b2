//! Canonical names for the bundled tools and their router categories.

pub const CURRENT_TIME: &str = "current_time";
pub const CALCULATE: &str = "calculate";

pub const CATEGORY_TIME: &str = "time";
pub const CATEGORY_MATH: &str = "math";
