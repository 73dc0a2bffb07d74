//! Fixed-width text rendering for the stats endpoints, plus the
//! subscription-date offset grammar used by `/api/v1/adjust_date`.

/// Render a padded text table: headers, a separator, then rows.
pub fn render_table(headers: &[String], rows: &[Vec<String>]) -> String {
	let mut widths: Vec<usize> = headers.iter().map(String::len).collect();
	for row in rows {
		for (i, cell) in row.iter().enumerate() {
			if i < widths.len() {
				widths[i] = widths[i].max(cell.len());
			}
		}
	}

	let render_row = |cells: &[String]| -> String {
		cells
			.iter()
			.enumerate()
			.map(|(i, cell)| format!("{:<width$}", cell, width = widths[i]))
			.collect::<Vec<_>>()
			.join("  ")
			.trim_end()
			.to_string()
	};

	let mut out = render_row(headers);
	out.push('\n');
	out.push_str(&"-".repeat(widths.iter().sum::<usize>() + 2 * widths.len().saturating_sub(1)));
	out.push('\n');
	for row in rows {
		out.push_str(&render_row(row));
		out.push('\n');
	}
	out
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DateAdjust {
	/// `0`: no expiry.
	Clear,
	/// Signed offset in seconds, e.g. `+30d13h` or `-3d`.
	Delta(i64),
}

/// Parses the `sub_end` offset grammar `[+-]Nd[Nh]`: `0`, or a sign
/// followed by a day term and an optional hour term.
pub fn parse_adjust(input: &str) -> Option<DateAdjust> {
	if input == "0" {
		return Some(DateAdjust::Clear);
	}
	let (sign, rest) = if let Some(rest) = input.strip_prefix('+') {
		(1i64, rest)
	} else if let Some(rest) = input.strip_prefix('-') {
		(-1i64, rest)
	} else {
		return None;
	};

	let (days, rest) = split_term(rest, 'd')?;
	let hours = if rest.is_empty() {
		0
	} else {
		let (hours, rest) = split_term(rest, 'h')?;
		if !rest.is_empty() {
			return None;
		}
		hours
	};
	let total = days.checked_mul(86_400)?.checked_add(hours.checked_mul(3_600)?)?;
	if total == 0 {
		return None;
	}
	Some(DateAdjust::Delta(sign * total))
}

/// Splits a leading `<n><unit>` term off `input`, returning the value and
/// whatever follows the unit.
fn split_term(input: &str, unit: char) -> Option<(i64, &str)> {
	let digits_end = input
		.find(|c: char| !c.is_ascii_digit())
		.unwrap_or(input.len());
	if digits_end == 0 {
		return None;
	}
	let value: i64 = input[..digits_end].parse().ok()?;
	let rest = input[digits_end..].strip_prefix(unit)?;
	Some((value, rest))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn table_pads_to_widest_cell() {
		let headers = vec!["user".to_string(), "rate".to_string()];
		let rows = vec![
			vec!["alice".to_string(), "240000".to_string()],
			vec!["b".to_string(), "0".to_string()],
		];
		let out = render_table(&headers, &rows);
		let lines: Vec<&str> = out.lines().collect();
		assert_eq!(lines[0], "user   rate");
		assert_eq!(lines[2], "alice  240000");
		assert_eq!(lines[3], "b      0");
	}

	#[test]
	fn offset_grammar() {
		assert_eq!(parse_adjust("0"), Some(DateAdjust::Clear));
		assert_eq!(parse_adjust("+30d"), Some(DateAdjust::Delta(30 * 86_400)));
		assert_eq!(parse_adjust("-3d"), Some(DateAdjust::Delta(-3 * 86_400)));
		assert_eq!(
			parse_adjust("+30d13h"),
			Some(DateAdjust::Delta(30 * 86_400 + 13 * 3_600))
		);
		assert_eq!(parse_adjust("+0d12h"), Some(DateAdjust::Delta(12 * 3_600)));
		// The grammar is exactly [+-]Nd[Nh]: no other units, no repeated
		// terms, no hour term without a day term.
		assert_eq!(parse_adjust("+90m"), None);
		assert_eq!(parse_adjust("+13h"), None);
		assert_eq!(parse_adjust("+1d1h1d"), None);
		assert_eq!(parse_adjust("+30d13h5"), None);
		assert_eq!(parse_adjust("30d"), None);
		assert_eq!(parse_adjust("+"), None);
		assert_eq!(parse_adjust("+d"), None);
		assert_eq!(parse_adjust("+30"), None);
		assert_eq!(parse_adjust("+30x"), None);
		assert_eq!(parse_adjust("+0d"), None);
		assert_eq!(parse_adjust(""), None);
	}
}
