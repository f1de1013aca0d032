use minijinja::Value;
use minijinja::value::ValueKind;

/// Largest integer an `f64` holds exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Render a value the way it appears in template output: `undefined` and
/// `null` for missing values, integral floats without a fraction and
/// sequences joined with `,`.
pub fn render_value(value: &Value) -> String {
	match value.kind() {
		ValueKind::Undefined => "undefined".to_string(),
		ValueKind::None => "null".to_string(),
		ValueKind::Number => {
			let rendered = value.to_string();
			match rendered.strip_suffix(".0") {
				Some(integral) => integral.to_string(),
				None => rendered,
			}
		}
		ValueKind::Seq => value
			.try_iter()
			.map(|items| items.map(|item| render_value(&item)).collect::<Vec<_>>().join(","))
			.unwrap_or_default(),
		_ => value.to_string(),
	}
}

/// Read a value as a number, accepting numeric strings.
pub fn to_number(value: &Value) -> Result<f64, String> {
	if let Some(text) = value.as_str() {
		return text
			.trim()
			.parse::<f64>()
			.map_err(|_| format!("`{text}` is not a number"));
	}

	f64::try_from(value.clone()).map_err(|_| format!("`{}` is not a number", render_value(value)))
}

/// Read a value as an integer, accepting integral floats and numeric strings.
pub fn to_integer(value: &Value) -> Result<i64, String> {
	if let Ok(integer) = i64::try_from(value.clone()) {
		return Ok(integer);
	}

	let number = to_number(value)?;
	if number.fract() == 0.0 && number.abs() <= MAX_SAFE_INTEGER {
		Ok(number as i64)
	} else {
		Err(format!("`{}` is not an integer", render_value(value)))
	}
}

/// Build a number value, preferring an integer when nothing is lost.
pub fn from_number(number: f64) -> Value {
	if number.fract() == 0.0 && number.abs() <= MAX_SAFE_INTEGER {
		Value::from(number as i64)
	} else {
		Value::from(number)
	}
}

/// The text of a value: strings as-is, everything else rendered.
pub fn to_text(value: &Value) -> String {
	value.as_str().map_or_else(|| render_value(value), ToString::to_string)
}

/// Whether a value counts as "nothing" for fallbacks such as `default`.
pub fn is_blank(value: &Value) -> bool {
	match value.kind() {
		ValueKind::Undefined | ValueKind::None => true,
		ValueKind::Bool => !value.is_true(),
		ValueKind::String => value.as_str().is_some_and(str::is_empty),
		_ => false,
	}
}
