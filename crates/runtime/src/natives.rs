//! Native function implementations
//!
//! This table is parallel to the signature table in `orus_core::natives`;
//! the compiler emits `CALL_NATIVE` with an index into it. Implementations
//! that produce no value return `Value::Nil` so the stack shape stays
//! uniform.

use std::time::{SystemTime, UNIX_EPOCH};

use orus_core::diag::RuntimeErrorKind;
use orus_core::heap::Heap;
use orus_core::value::Value;

use crate::vm::{RtErr, RtResult, type_mismatch};

pub type NativeImpl = fn(&mut Heap, &[Value]) -> RtResult<Value>;

/// Implementations in the same order as `orus_core::natives::NATIVES`.
pub const NATIVE_IMPLS: &[NativeImpl] = &[
    native_sqrt,
    native_floor,
    native_ceil,
    native_pow,
    native_fabs,
    native_iabs,
    native_len,
    native_push,
    native_pop,
    native_str,
    native_clock_ms,
];

fn want_f64(value: Value) -> RtResult<f64> {
    match value {
        Value::F64(x) => Ok(x),
        other => Err(type_mismatch("f64", other)),
    }
}

fn native_sqrt(_heap: &mut Heap, args: &[Value]) -> RtResult<Value> {
    Ok(Value::F64(want_f64(args[0])?.sqrt()))
}

fn native_floor(_heap: &mut Heap, args: &[Value]) -> RtResult<Value> {
    Ok(Value::F64(want_f64(args[0])?.floor()))
}

fn native_ceil(_heap: &mut Heap, args: &[Value]) -> RtResult<Value> {
    Ok(Value::F64(want_f64(args[0])?.ceil()))
}

fn native_pow(_heap: &mut Heap, args: &[Value]) -> RtResult<Value> {
    Ok(Value::F64(want_f64(args[0])?.powf(want_f64(args[1])?)))
}

fn native_fabs(_heap: &mut Heap, args: &[Value]) -> RtResult<Value> {
    Ok(Value::F64(want_f64(args[0])?.abs()))
}

fn native_iabs(_heap: &mut Heap, args: &[Value]) -> RtResult<Value> {
    match args[0] {
        Value::I32(n) => n.checked_abs().map(Value::I32).ok_or_else(overflow),
        other => Err(type_mismatch("i32", other)),
    }
}

fn overflow() -> RtErr {
    (
        RuntimeErrorKind::ArithmeticOverflow,
        "arithmetic overflow".to_string(),
    )
}

fn native_len(heap: &mut Heap, args: &[Value]) -> RtResult<Value> {
    let len = match args[0] {
        Value::Str(id) => heap.string(id).len(),
        Value::Array(id) => heap.array(id).len(),
        other => return Err(type_mismatch("string or array", other)),
    };
    Ok(Value::I32(len as i32))
}

fn native_push(heap: &mut Heap, args: &[Value]) -> RtResult<Value> {
    let Value::Array(id) = args[0] else {
        return Err(type_mismatch("array", args[0]));
    };
    heap.array_mut(id).push(args[1]);
    heap.note_array_growth(1);
    Ok(Value::Nil)
}

fn native_pop(heap: &mut Heap, args: &[Value]) -> RtResult<Value> {
    let Value::Array(id) = args[0] else {
        return Err(type_mismatch("array", args[0]));
    };
    heap.array_mut(id).pop().ok_or_else(|| {
        (
            RuntimeErrorKind::IndexOutOfBounds,
            "pop from an empty array".to_string(),
        )
    })
}

fn native_str(heap: &mut Heap, args: &[Value]) -> RtResult<Value> {
    let text = heap.render(args[0]);
    Ok(Value::Str(heap.alloc_string(text)))
}

fn native_clock_ms(_heap: &mut Heap, _args: &[Value]) -> RtResult<Value> {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Ok(Value::I64(millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use orus_core::natives::NATIVES;

    #[test]
    fn impl_table_matches_signature_table() {
        assert_eq!(NATIVE_IMPLS.len(), NATIVES.len());
    }

    #[test]
    fn sqrt_and_pow() {
        let mut heap = Heap::new();
        assert_eq!(
            native_sqrt(&mut heap, &[Value::F64(16.0)]).unwrap(),
            Value::F64(4.0)
        );
        assert_eq!(
            native_pow(&mut heap, &[Value::F64(2.0), Value::F64(10.0)]).unwrap(),
            Value::F64(1024.0)
        );
    }

    #[test]
    fn len_works_on_strings_and_arrays() {
        let mut heap = Heap::new();
        let s = heap.alloc_string("four");
        let a = heap.alloc_array(vec![Value::I32(1), Value::I32(2)]);
        assert_eq!(
            native_len(&mut heap, &[Value::Str(s)]).unwrap(),
            Value::I32(4)
        );
        assert_eq!(
            native_len(&mut heap, &[Value::Array(a)]).unwrap(),
            Value::I32(2)
        );
        assert!(native_len(&mut heap, &[Value::I32(1)]).is_err());
    }

    #[test]
    fn push_and_pop_round_trip() {
        let mut heap = Heap::new();
        let a = heap.alloc_array(Vec::new());
        native_push(&mut heap, &[Value::Array(a), Value::I32(7)]).unwrap();
        assert_eq!(
            native_pop(&mut heap, &[Value::Array(a)]).unwrap(),
            Value::I32(7)
        );
        let err = native_pop(&mut heap, &[Value::Array(a)]).unwrap_err();
        assert_eq!(err.0, RuntimeErrorKind::IndexOutOfBounds);
    }

    #[test]
    fn str_renders_any_value() {
        let mut heap = Heap::new();
        let Value::Str(id) = native_str(&mut heap, &[Value::F64(2.5)]).unwrap() else {
            panic!("expected string");
        };
        assert_eq!(heap.string(id), "2.5");
    }
}
