//! `%`-style string formatting.
//!
//! Supports the positional (`"%s %d" % (a, b)`, `"%s" % a`) and mapping
//! (`"%(key)s" % {...}`) forms with flags `- 0 + space #`, width
//! (including `*`), precision (including `*`), and the conversions
//! `s r a d i u f F e E g G x X o c %`.

use crate::{
    except::{ExcType, RunResult},
    heap::HeapData,
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    value::Value,
    bytecode::vm::Vm,
};

#[derive(Debug, Default, Clone, Copy)]
struct Flags {
    left_align: bool,
    zero_pad: bool,
    plus_sign: bool,
    space_sign: bool,
    alternate: bool,
}

/// Formats `fmt % args`.
pub(crate) fn format_percent<T: ResourceTracker, P: PrintWriter, Tr: VmTracer>(
    vm: &mut Vm<'_, T, P, Tr>,
    fmt: &Value,
    args: &Value,
) -> RunResult<String> {
    let template = fmt
        .as_str(vm.heap, vm.interns)
        .expect("format_percent called on a non-string")
        .to_owned();

    // Positional arguments are a tuple (or one bare value); a dict at the
    // right selects the mapping form.
    let mut mapping_id = None;
    let positional: Vec<Value> = match args {
        Value::Ref(id) => match vm.heap.get(*id) {
            HeapData::Tuple(tuple) => tuple.items().iter().map(|v| v.clone_with_heap(vm.heap)).collect(),
            HeapData::Dict(_) => {
                mapping_id = Some(*id);
                Vec::new()
            }
            _ => vec![args.clone_with_heap(vm.heap)],
        },
        other => vec![other.clone_with_heap(vm.heap)],
    };

    let result = format_with(vm, &template, &positional, mapping_id);
    for value in positional {
        value.drop_with_heap(vm.heap);
    }
    result
}

fn format_with<T: ResourceTracker, P: PrintWriter, Tr: VmTracer>(
    vm: &mut Vm<'_, T, P, Tr>,
    template: &str,
    positional: &[Value],
    mapping_id: Option<crate::heap::HeapId>,
) -> RunResult<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    let mut next_positional = 0usize;

    let mut take_positional = |index: &mut usize| -> RunResult<usize> {
        if *index >= positional.len() {
            return Err(ExcType::type_error("not enough arguments for format string"));
        }
        let current = *index;
        *index += 1;
        Ok(current)
    };

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }

        // Mapping key.
        let mapping_key = if chars.peek() == Some(&'(') {
            chars.next();
            let mut key = String::new();
            loop {
                match chars.next() {
                    Some(')') => break,
                    Some(c) => key.push(c),
                    None => return Err(ExcType::value_error("incomplete format key")),
                }
            }
            Some(key)
        } else {
            None
        };

        // Flags.
        let mut flags = Flags::default();
        loop {
            match chars.peek() {
                Some('-') => {
                    flags.left_align = true;
                    chars.next();
                }
                Some('0') => {
                    flags.zero_pad = true;
                    chars.next();
                }
                Some('+') => {
                    flags.plus_sign = true;
                    chars.next();
                }
                Some(' ') => {
                    flags.space_sign = true;
                    chars.next();
                }
                Some('#') => {
                    flags.alternate = true;
                    chars.next();
                }
                _ => break,
            }
        }

        // Width.
        let mut width: Option<usize> = None;
        if chars.peek() == Some(&'*') {
            chars.next();
            let index = take_positional(&mut next_positional)?;
            let w = positional[index]
                .as_int()
                .ok_or_else(|| ExcType::type_error("* wants int"))?;
            if w < 0 {
                flags.left_align = true;
                width = Some(w.unsigned_abs() as usize);
            } else {
                width = Some(w as usize);
            }
        } else {
            let mut digits = String::new();
            while let Some(c) = chars.peek() {
                if c.is_ascii_digit() {
                    digits.push(*c);
                    chars.next();
                } else {
                    break;
                }
            }
            if !digits.is_empty() {
                width = digits.parse().ok();
            }
        }

        // Precision.
        let mut precision: Option<usize> = None;
        if chars.peek() == Some(&'.') {
            chars.next();
            if chars.peek() == Some(&'*') {
                chars.next();
                let index = take_positional(&mut next_positional)?;
                let p = positional[index]
                    .as_int()
                    .ok_or_else(|| ExcType::type_error("* wants int"))?;
                precision = Some(p.max(0) as usize);
            } else {
                let mut digits = String::new();
                while let Some(c) = chars.peek() {
                    if c.is_ascii_digit() {
                        digits.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                precision = Some(digits.parse().unwrap_or(0));
            }
        }

        let conversion = chars
            .next()
            .ok_or_else(|| ExcType::value_error("incomplete format"))?;

        // Fetch the value for this directive.
        let value = match (&mapping_key, mapping_id) {
            (Some(key), Some(dict_id)) => {
                let key_value = vm.make_str(key.clone())?;
                let found = vm.dict_get_value(dict_id, &key_value)?;
                key_value.drop_with_heap(vm.heap);
                found.ok_or_else(|| ExcType::key_error(format!("'{key}'")))?
            }
            (Some(_), None) => return Err(ExcType::type_error("format requires a mapping")),
            (None, _) => {
                let index = take_positional(&mut next_positional)?;
                positional[index].clone_with_heap(vm.heap)
            }
        };

        let piece = render(vm, &value, conversion, flags, precision);
        value.drop_with_heap(vm.heap);
        let piece = piece?;
        push_padded(&mut out, &piece, width, flags);
    }

    if mapping_id.is_none() && next_positional < positional.len() {
        return Err(ExcType::type_error("not all arguments converted during string formatting"));
    }
    Ok(out)
}

fn push_padded(out: &mut String, piece: &str, width: Option<usize>, flags: Flags) {
    let Some(width) = width else {
        out.push_str(piece);
        return;
    };
    let len = piece.chars().count();
    if len >= width {
        out.push_str(piece);
        return;
    }
    let pad = width - len;
    if flags.left_align {
        out.push_str(piece);
        out.extend(std::iter::repeat_n(' ', pad));
    } else if flags.zero_pad && piece.starts_with(['-', '+']) {
        // Zero padding goes between the sign and the digits.
        out.push(piece.as_bytes()[0] as char);
        out.extend(std::iter::repeat_n('0', pad));
        out.push_str(&piece[1..]);
    } else if flags.zero_pad {
        out.extend(std::iter::repeat_n('0', pad));
        out.push_str(piece);
    } else {
        out.extend(std::iter::repeat_n(' ', pad));
        out.push_str(piece);
    }
}

fn render<T: ResourceTracker, P: PrintWriter, Tr: VmTracer>(
    vm: &mut Vm<'_, T, P, Tr>,
    value: &Value,
    conversion: char,
    flags: Flags,
    precision: Option<usize>,
) -> RunResult<String> {
    match conversion {
        's' => {
            let mut text = vm.value_str(value)?;
            if let Some(precision) = precision {
                text = text.chars().take(precision).collect();
            }
            Ok(text)
        }
        'r' | 'a' => {
            let mut text = vm.value_repr(value)?;
            if conversion == 'a' {
                text = text
                    .chars()
                    .map(|c| if c.is_ascii() { c.to_string() } else { format!("\\u{:04x}", c as u32) })
                    .collect();
            }
            if let Some(precision) = precision {
                text = text.chars().take(precision).collect();
            }
            Ok(text)
        }
        'd' | 'i' | 'u' => {
            let n = int_operand(vm, value, conversion)?;
            Ok(signed_text(n < 0, n.unsigned_abs().to_string(), flags))
        }
        'x' | 'X' | 'o' => {
            let n = int_operand(vm, value, conversion)?;
            let magnitude = n.unsigned_abs();
            let digits = match conversion {
                'x' => format!("{magnitude:x}"),
                'X' => format!("{magnitude:X}"),
                _ => format!("{magnitude:o}"),
            };
            let prefixed = if flags.alternate {
                match conversion {
                    'x' => format!("0x{digits}"),
                    'X' => format!("0X{digits}"),
                    _ => format!("0o{digits}"),
                }
            } else {
                digits
            };
            Ok(signed_text(n < 0, prefixed, flags))
        }
        'f' | 'F' => {
            let v = float_operand(vm, value, conversion)?;
            let precision = precision.unwrap_or(6);
            let negative = v < 0.0 || (v == 0.0 && v.is_sign_negative());
            Ok(signed_text(negative, format!("{:.*}", precision, v.abs()), flags))
        }
        'e' | 'E' => {
            let v = float_operand(vm, value, conversion)?;
            let precision = precision.unwrap_or(6);
            let text = exponent_format(v.abs(), precision, conversion == 'E');
            Ok(signed_text(v < 0.0, text, flags))
        }
        'g' | 'G' => {
            let v = float_operand(vm, value, conversion)?;
            let significant = precision.unwrap_or(6).max(1);
            let text = general_format(v.abs(), significant, conversion == 'G', flags.alternate);
            Ok(signed_text(v < 0.0, text, flags))
        }
        'c' => {
            if let Some(n) = value.as_int() {
                let c = u32::try_from(n)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| ExcType::overflow_error("%c arg not in range"))?;
                return Ok(c.to_string());
            }
            if let Some(s) = value.as_str(vm.heap, vm.interns) {
                let mut chars = s.chars();
                if let (Some(c), None) = (chars.next(), chars.next()) {
                    return Ok(c.to_string());
                }
            }
            Err(ExcType::type_error("%c requires int or char"))
        }
        other => Err(ExcType::value_error(format!(
            "unsupported format character '{other}'"
        ))),
    }
}

fn signed_text(negative: bool, magnitude: String, flags: Flags) -> String {
    if negative {
        format!("-{magnitude}")
    } else if flags.plus_sign {
        format!("+{magnitude}")
    } else if flags.space_sign {
        format!(" {magnitude}")
    } else {
        magnitude
    }
}

fn int_operand<T: ResourceTracker, P: PrintWriter, Tr: VmTracer>(
    vm: &Vm<'_, T, P, Tr>,
    value: &Value,
    conversion: char,
) -> RunResult<i64> {
    match value {
        Value::Bool(b) => Ok(i64::from(*b)),
        Value::Int(i) => Ok(*i),
        Value::Float(f) => Ok(f.trunc() as i64),
        _ => Err(ExcType::type_error(format!(
            "%{conversion} format: a real number is required, not {}",
            value.type_name(vm.heap, vm.interns)
        ))),
    }
}

fn float_operand<T: ResourceTracker, P: PrintWriter, Tr: VmTracer>(
    vm: &Vm<'_, T, P, Tr>,
    value: &Value,
    conversion: char,
) -> RunResult<f64> {
    value.as_float(vm.heap).ok_or_else(|| {
        ExcType::type_error(format!(
            "%{conversion} format: a real number is required, not {}",
            value.type_name(vm.heap, vm.interns)
        ))
    })
}

/// `%e` rendering: `d.dddddde±XX` with a two-digit exponent minimum.
fn exponent_format(value: f64, precision: usize, upper: bool) -> String {
    if value == 0.0 {
        let mantissa = format!("{:.*}", precision, 0.0);
        return format!("{mantissa}{}+00", if upper { 'E' } else { 'e' });
    }
    let exponent = value.abs().log10().floor() as i32;
    let mantissa = value / 10f64.powi(exponent);
    // Rounding the mantissa may carry it to 10.0.
    let mut mantissa = mantissa;
    let mut exponent = exponent;
    let rounded = format!("{:.*}", precision, mantissa);
    if rounded.parse::<f64>().unwrap_or(mantissa) >= 10.0 {
        mantissa /= 10.0;
        exponent += 1;
    }
    let e = if upper { 'E' } else { 'e' };
    let sign = if exponent < 0 { '-' } else { '+' };
    format!("{:.*}{e}{sign}{:02}", precision, mantissa, exponent.abs())
}

/// `%g` rendering: fixed or exponent form by magnitude, trailing zeros
/// stripped unless `#`.
fn general_format(value: f64, significant: usize, upper: bool, keep_zeros: bool) -> String {
    if value == 0.0 {
        return "0".to_owned();
    }
    let exponent = value.abs().log10().floor() as i32;
    let mut text = if exponent < -4 || exponent >= significant as i32 {
        exponent_format(value, significant.saturating_sub(1), upper)
    } else {
        let decimals = (significant as i32 - 1 - exponent).max(0) as usize;
        format!("{:.*}", decimals, value)
    };
    if !keep_zeros && text.contains('.') && !text.contains(['e', 'E']) {
        while text.ends_with('0') {
            text.pop();
        }
        if text.ends_with('.') {
            text.pop();
        }
    }
    text
}
