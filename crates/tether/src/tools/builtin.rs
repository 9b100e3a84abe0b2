//! Small bundled tools, useful for smoke-testing a backend end to end.

use super::core::FnTool;
use super::names::{CALCULATE, CATEGORY_MATH, CATEGORY_TIME, CURRENT_TIME};
use crate::{ToolDef, ToolError};
use chrono::{FixedOffset, Utc};
use schemars::JsonSchema;
use serde::Deserialize;

/// Arguments for `current_time`.
#[derive(Deserialize, JsonSchema)]
pub struct CurrentTimeArgs {
    /// Offset from UTC in whole hours, e.g. -5 or 9. Defaults to UTC.
    #[serde(default)]
    pub utc_offset_hours: Option<i32>,
}

/// Current date and time, RFC 3339 formatted.
pub fn clock_tool() -> FnTool {
    FnTool::new(
        ToolDef::from_schema::<CurrentTimeArgs>(
            CURRENT_TIME,
            "Get the current date and time, optionally at a fixed UTC offset.",
        ),
        |args: CurrentTimeArgs| async move {
            let hours = args.utc_offset_hours.unwrap_or(0);
            let offset = hours.checked_mul(3600).and_then(FixedOffset::east_opt);
            let offset = offset.ok_or_else(|| {
                ToolError::InvalidArguments(format!("utc offset {hours}h is out of range"))
            })?;
            Ok(Utc::now().with_timezone(&offset).to_rfc3339())
        },
    )
    .with_category(CATEGORY_TIME)
}

/// Arithmetic operation for `calculate`.
#[derive(Deserialize, JsonSchema, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Add,
    Subtract,
    Multiply,
    Divide,
}

/// Arguments for `calculate`.
#[derive(Deserialize, JsonSchema)]
pub struct CalculateArgs {
    pub operation: Operation,
    pub a: f64,
    pub b: f64,
}

/// Apply `op` to two operands.
pub fn calculate(op: Operation, a: f64, b: f64) -> Result<f64, ToolError> {
    match op {
        Operation::Add => Ok(a + b),
        Operation::Subtract => Ok(a - b),
        Operation::Multiply => Ok(a * b),
        Operation::Divide if b == 0.0 => Err(ToolError::msg("division by zero")),
        Operation::Divide => Ok(a / b),
    }
}

/// Two-operand arithmetic.
pub fn calculator_tool() -> FnTool {
    FnTool::new(
        ToolDef::from_schema::<CalculateArgs>(
            CALCULATE,
            "Add, subtract, multiply or divide two numbers.",
        ),
        |args: CalculateArgs| async move {
            calculate(args.operation, args.a, args.b).map(|v| v.to_string())
        },
    )
    .with_category(CATEGORY_MATH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::core::{Tool, ToolRegistry};
    use serde_json::json;

    #[test]
    fn calculate_ops() {
        assert_eq!(calculate(Operation::Add, 2.0, 3.0).unwrap(), 5.0);
        assert_eq!(calculate(Operation::Divide, 9.0, 3.0).unwrap(), 3.0);
        assert!(calculate(Operation::Divide, 1.0, 0.0).is_err());
    }

    #[tokio::test]
    async fn builtin_tools_dispatch() {
        let registry = ToolRegistry::new()
            .with(clock_tool())
            .with(calculator_tool());

        let sum = registry
            .dispatch(CALCULATE, &json!({"operation": "multiply", "a": 6, "b": 7}))
            .await;
        assert_eq!(sum.result, "42");

        let now = registry.dispatch(CURRENT_TIME, &json!({"utc_offset_hours": 9})).await;
        assert!(!now.is_error);
        assert!(now.result.ends_with("+09:00"));

        let bad = registry
            .dispatch(CURRENT_TIME, &json!({"utc_offset_hours": 99}))
            .await;
        assert!(bad.is_error);

        let huge = registry
            .dispatch(CURRENT_TIME, &json!({"utc_offset_hours": i32::MAX}))
            .await;
        assert!(huge.is_error);
        assert!(huge.result.contains("out of range"), "{}", huge.result);
    }

    #[test]
    fn categories_match_router_groups() {
        assert_eq!(clock_tool().category(), CATEGORY_TIME);
        assert_eq!(calculator_tool().category(), CATEGORY_MATH);
    }
}
