// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Format-spec mini-language applied to a resolved field value.
//!
//! The grammar is the usual `[[fill]align][sign][#][0][width][grouping][.precision][type]`.
//! Journal values are always text, so a value is formatted as a string unless
//! the format spec asks for a numeric presentation: an explicit numeric type, or one
//! of the flags that only make sense for numbers (explicit sign, `0`, grouping,
//! `=` alignment) applied to a value that parses as a number.

use std::fmt::Write;

const INTEGER_TYPES: &[char] = &['b', 'c', 'd', 'n', 'o', 'x', 'X'];
const FLOAT_TYPES: &[char] = &['e', 'E', 'f', 'F', 'g', 'G', '%'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    Left,
    Right,
    Center,
    AfterSign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sign {
    Minus,
    Plus,
    Space,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatSpec {
    fill: Option<char>,
    align: Option<Align>,
    sign: Option<Sign>,
    alternate: bool,
    zero: bool,
    width: Option<usize>,
    grouping: Option<char>,
    precision: Option<usize>,
    kind: Option<char>,
}

fn align_of(c: char) -> Option<Align> {
    match c {
        '<' => Some(Align::Left),
        '>' => Some(Align::Right),
        '^' => Some(Align::Center),
        '=' => Some(Align::AfterSign),
        _ => None,
    }
}

/// Reads a run of digits. An absent run is `None`, one that overflows is an error.
fn take_digits(chars: &[char], pos: &mut usize) -> Result<Option<usize>, String> {
    let start = *pos;
    while *pos < chars.len() && chars[*pos].is_ascii_digit() {
        *pos += 1;
    }
    if start == *pos {
        return Ok(None);
    }
    let digits: String = chars[start..*pos].iter().collect();
    digits
        .parse()
        .map(Some)
        .map_err(|_| format!("{digits} is too large"))
}

impl FormatSpec {
    /// Parses a format spec, rejecting combinations that can never format.
    pub fn parse(spec: &str) -> Result<Self, String> {
        let chars: Vec<char> = spec.chars().collect();
        let mut pos = 0;
        let mut parsed = FormatSpec {
            fill: None,
            align: None,
            sign: None,
            alternate: false,
            zero: false,
            width: None,
            grouping: None,
            precision: None,
            kind: None,
        };

        if chars.len() >= 2 && align_of(chars[1]).is_some() {
            parsed.fill = Some(chars[0]);
            parsed.align = align_of(chars[1]);
            pos = 2;
        } else if let Some(align) = chars.first().copied().and_then(align_of) {
            parsed.align = Some(align);
            pos = 1;
        }

        parsed.sign = match chars.get(pos) {
            Some('+') => Some(Sign::Plus),
            Some('-') => Some(Sign::Minus),
            Some(' ') => Some(Sign::Space),
            _ => None,
        };
        if parsed.sign.is_some() {
            pos += 1;
        }

        if chars.get(pos) == Some(&'#') {
            parsed.alternate = true;
            pos += 1;
        }
        if chars.get(pos) == Some(&'0') {
            parsed.zero = true;
            pos += 1;
        }
        parsed.width = take_digits(&chars, &mut pos)?;

        if let Some(&c) = chars.get(pos) {
            if c == ',' || c == '_' {
                parsed.grouping = Some(c);
                pos += 1;
            }
        }

        if chars.get(pos) == Some(&'.') {
            pos += 1;
            parsed.precision = Some(
                take_digits(&chars, &mut pos)?.ok_or_else(|| "format specifier missing precision".to_string())?,
            );
        }

        if let Some(&c) = chars.get(pos) {
            if c == 's' || INTEGER_TYPES.contains(&c) || FLOAT_TYPES.contains(&c) {
                parsed.kind = Some(c);
                pos += 1;
            }
        }

        if pos != chars.len() {
            return Err(format!("unexpected {:?}", chars[pos..].iter().collect::<String>()));
        }

        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> Result<(), String> {
        match self.kind {
            Some('s') => {
                if self.sign.is_some() {
                    return Err("sign not allowed in string format specifier".to_string());
                }
                if self.align == Some(Align::AfterSign) {
                    return Err("'=' alignment not allowed in string format specifier".to_string());
                }
                if self.alternate {
                    return Err("alternate form (#) not allowed in string format specifier".to_string());
                }
                if self.grouping.is_some() {
                    return Err("cannot specify grouping with 's'".to_string());
                }
            }
            Some(kind) if INTEGER_TYPES.contains(&kind) => {
                if self.precision.is_some() {
                    return Err("precision not allowed in integer format specifier".to_string());
                }
                if kind == 'c' && (self.sign.is_some() || self.alternate || self.grouping.is_some()) {
                    return Err("sign, '#' and grouping not allowed with 'c'".to_string());
                }
                if self.grouping == Some(',') && kind != 'd' {
                    return Err(format!("cannot specify ',' with '{kind}'"));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn is_numeric_request(&self) -> bool {
        self.sign.is_some() || self.zero || self.grouping.is_some() || self.align == Some(Align::AfterSign)
    }

    /// Applies the format spec to `value`. The error string explains why the value
    /// cannot be presented the requested way.
    pub fn apply(&self, value: &str) -> Result<String, String> {
        match self.kind {
            Some('s') => Ok(self.format_str(value)),
            Some(kind) if INTEGER_TYPES.contains(&kind) => {
                let number = parse_integer(value)
                    .ok_or_else(|| format!("'{kind}' requires an integer value"))?;
                self.format_integer(number, kind)
            }
            Some(kind) => {
                let number = parse_float(value).ok_or_else(|| format!("'{kind}' requires a numeric value"))?;
                Ok(self.format_float(number, kind))
            }
            None if self.is_numeric_request() => {
                if let Some(number) = parse_integer(value) {
                    self.format_integer(number, 'd')
                } else if let Some(number) = parse_float(value) {
                    Ok(self.format_float(number, if self.precision.is_some() { 'g' } else { 'r' }))
                } else {
                    Err("sign, '0', grouping and '=' require a numeric value".to_string())
                }
            }
            None => Ok(self.format_str(value)),
        }
    }

    fn format_str(&self, value: &str) -> String {
        let body: String = match self.precision {
            Some(precision) => value.chars().take(precision).collect(),
            None => value.to_string(),
        };
        self.pad("", &body, Align::Left)
    }

    fn format_integer(&self, number: i128, kind: char) -> Result<String, String> {
        if kind == 'c' {
            let c = u32::try_from(number)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| format!("{number} is not a valid code point"))?;
            return Ok(self.pad("", &c.to_string(), Align::Right));
        }

        let magnitude = number.unsigned_abs();
        let (digits, prefix, group_size) = match kind {
            'b' => (format!("{magnitude:b}"), "0b", 4),
            'o' => (format!("{magnitude:o}"), "0o", 4),
            'x' => (format!("{magnitude:x}"), "0x", 4),
            'X' => (format!("{magnitude:X}"), "0X", 4),
            _ => (magnitude.to_string(), "", 3),
        };
        let digits = match self.grouping {
            Some(separator) => group_digits(&digits, separator, group_size),
            None => digits,
        };

        let mut lead = self.sign_str(number < 0).to_string();
        if self.alternate {
            lead.push_str(prefix);
        }
        Ok(self.pad(&lead, &digits, Align::Right))
    }

    fn format_float(&self, number: f64, kind: char) -> String {
        let negative = number.is_sign_negative() && !number.is_nan();
        let magnitude = number.abs();
        let upper = kind.is_ascii_uppercase();

        let body = if magnitude.is_nan() {
            "nan".to_string()
        } else if magnitude.is_infinite() {
            "inf".to_string()
        } else {
            match kind {
                'f' | 'F' => format!("{:.*}", self.precision.unwrap_or(6), magnitude),
                'e' | 'E' => scientific(magnitude, self.precision.unwrap_or(6)),
                '%' => format!("{:.*}%", self.precision.unwrap_or(6), magnitude * 100.0),
                'g' | 'G' => general(magnitude, self.precision.unwrap_or(6), self.alternate),
                _ => magnitude.to_string(),
            }
        };
        let body = if upper { body.to_uppercase() } else { body };
        let body = match self.grouping {
            Some(separator) => {
                let split = body.find(|c: char| !c.is_ascii_digit()).unwrap_or(body.len());
                format!("{}{}", group_digits(&body[..split], separator, 3), &body[split..])
            }
            None => body,
        };
        self.pad(self.sign_str(negative), &body, Align::Right)
    }

    fn sign_str(&self, negative: bool) -> &'static str {
        if negative {
            return "-";
        }
        match self.sign {
            Some(Sign::Plus) => "+",
            Some(Sign::Space) => " ",
            _ => "",
        }
    }

    fn pad(&self, lead: &str, body: &str, default_align: Align) -> String {
        let used = lead.chars().count() + body.chars().count();
        let width = self.width.unwrap_or(0);
        if width <= used {
            return format!("{lead}{body}");
        }

        let (fill, align) = match (self.fill, self.align, self.zero) {
            (fill, Some(align), _) => (fill.unwrap_or(if self.zero { '0' } else { ' ' }), align),
            (_, None, true) if default_align == Align::Right => ('0', Align::AfterSign),
            (_, None, true) => ('0', default_align),
            (_, None, false) => (' ', default_align),
        };

        let padding = width - used;
        let fill_str = |n: usize| std::iter::repeat(fill).take(n).collect::<String>();
        match align {
            Align::Left => format!("{lead}{body}{}", fill_str(padding)),
            Align::Right => format!("{}{lead}{body}", fill_str(padding)),
            Align::Center => {
                let left = padding / 2;
                format!("{}{lead}{body}{}", fill_str(left), fill_str(padding - left))
            }
            Align::AfterSign => format!("{lead}{}{body}", fill_str(padding)),
        }
    }
}

fn parse_integer(value: &str) -> Option<i128> {
    value.trim().replace('_', "").parse().ok()
}

fn parse_float(value: &str) -> Option<f64> {
    let trimmed = value.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "nan" | "+nan" | "-nan" => Some(f64::NAN),
        "inf" | "+inf" | "infinity" => Some(f64::INFINITY),
        "-inf" | "-infinity" => Some(f64::NEG_INFINITY),
        _ => trimmed.parse().ok(),
    }
}

fn group_digits(digits: &str, separator: char, size: usize) -> String {
    let count = digits.chars().count();
    let mut out = String::with_capacity(count + count / size);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (count - i) % size == 0 {
            out.push(separator);
        }
        out.push(c);
    }
    out
}

/// `1.5e3` → `1.500000e+03`: exponent always signed and at least two digits.
fn scientific(magnitude: f64, precision: usize) -> String {
    let raw = format!("{:.*e}", precision, magnitude);
    let (mantissa, exponent) = raw.split_once('e').unwrap_or((raw.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let mut out = String::with_capacity(mantissa.len() + 4);
    let _ = write!(
        out,
        "{mantissa}e{}{:02}",
        if exponent < 0 { '-' } else { '+' },
        exponent.abs()
    );
    out
}

fn general(magnitude: f64, precision: usize, alternate: bool) -> String {
    let precision = precision.max(1);
    if magnitude == 0.0 {
        return if alternate {
            format!("{:.*}", precision - 1, 0.0)
        } else {
            "0".to_string()
        };
    }

    // Exponent after rounding to `precision` significant digits.
    let rounded = scientific(magnitude, precision - 1);
    let exponent: i32 = rounded
        .rsplit_once('e')
        .and_then(|(_, e)| e.parse().ok())
        .unwrap_or(0);

    let body = if exponent >= -4 && exponent < precision as i32 {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        format!("{:.*}", decimals, magnitude)
    } else {
        rounded
    };
    if alternate {
        return body;
    }

    match body.split_once('e') {
        Some((mantissa, exponent)) => format!("{}e{}", strip_zeros(mantissa), exponent),
        None => strip_zeros(&body).to_string(),
    }
}

fn strip_zeros(number: &str) -> &str {
    if number.contains('.') {
        number.trim_end_matches('0').trim_end_matches('.')
    } else {
        number
    }
}
