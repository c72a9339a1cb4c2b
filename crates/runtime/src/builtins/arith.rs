//! Arithmetic, comparison, and numeric predicates
//!
//! Integer operations are checked; overflow surfaces as a value error.
//! Mixed int/float arguments promote to float (the contagion contract the
//! VM's fast-path opcodes fall back to).

use super::{b, check_exact, check_min, check_range};
use crate::registry::BuiltinDef;
use sable_core::cmp::{numeric_equals, value_compare, value_equals};
use sable_core::error::SableError;
use sable_core::value::Value;
use std::cmp::Ordering;

pub fn builtins() -> Vec<BuiltinDef> {
    vec![
        b!("+", add, "([] [x] [x y] [x y & more])", "Returns the sum of nums; (+) returns 0."),
        b!("-", sub, "([x] [x y & more])", "Subtracts ys from x; unary negates."),
        b!("*", mul, "([] [x] [x y & more])", "Returns the product of nums; (*) returns 1."),
        b!("/", div, "([x] [x y & more])", "Divides x by the ys; integer division falls to float when inexact."),
        b!("quot", quot, "([num div])", "Quotient of dividing num by div, truncated toward zero."),
        b!("rem", rem, "([num div])", "Remainder of dividing num by div."),
        b!("mod", modulo, "([num div])", "Modulus of num and div, floored."),
        b!("inc", inc, "([x])", "Returns a number one greater than x."),
        b!("dec", dec, "([x])", "Returns a number one less than x."),
        b!("max", max, "([x & more])", "Returns the greatest of the nums."),
        b!("min", min, "([x & more])", "Returns the least of the nums."),
        b!("abs", abs, "([x])", "Absolute value of x."),
        b!("floor", floor, "([x])", "Largest integer less than or equal to x, as a float for float input."),
        b!("ceil", ceil, "([x])", "Smallest integer greater than or equal to x."),
        b!("sqrt", sqrt, "([x])", "Square root of x."),
        b!("pow", pow, "([base exp])", "base raised to exp."),
        b!("=", eq, "([x] [x y & more])", "Structural equality."),
        b!("not=", not_eq, "([x] [x y & more])", "Complement of =."),
        b!("==", num_eq, "([x] [x y & more])", "Numeric equality across int and float."),
        b!("<", lt, "([x] [x y & more])", "Monotonically increasing test."),
        b!("<=", lte, "([x] [x y & more])", "Monotonically non-decreasing test."),
        b!(">", gt, "([x] [x y & more])", "Monotonically decreasing test."),
        b!(">=", gte, "([x] [x y & more])", "Monotonically non-increasing test."),
        b!("compare", compare, "([x y])", "Comparator returning -1, 0, or 1."),
        b!("zero?", zero_p, "([x])", "True if x is zero."),
        b!("pos?", pos_p, "([x])", "True if x is positive."),
        b!("neg?", neg_p, "([x])", "True if x is negative."),
        b!("even?", even_p, "([n])", "True if n is even."),
        b!("odd?", odd_p, "([n])", "True if n is odd."),
        b!("number?", number_p, "([x])", "True if x is a number."),
        b!("integer?", integer_p, "([x])", "True if x is an integer."),
        b!("int?", integer_p, "([x])", "True if x is an integer."),
        b!("float?", float_p, "([x])", "True if x is a float."),
        b!("int", to_int, "([x])", "Coerce to integer, truncating floats."),
        b!("double", to_double, "([x])", "Coerce to float."),
        b!("rand-int", rand_int, "([n])", "A number from 0 (inclusive) to n (exclusive), derived from the system clock."),
    ]
}

enum Num {
    Int(i64),
    Float(f64),
}

fn as_num(name: &str, v: &Value) -> Result<Num, SableError> {
    match v {
        Value::Int(n) => Ok(Num::Int(*n)),
        Value::Float(f) => Ok(Num::Float(*f)),
        other => Err(SableError::type_err(format!(
            "{} expects a number, got {}",
            name,
            other.type_name()
        ))),
    }
}

fn overflow(op: &str) -> SableError {
    SableError::value_err(format!("integer overflow in {}", op))
}

fn fold(
    name: &'static str,
    args: &[Value],
    identity: i64,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, SableError> {
    if args.is_empty() {
        return Ok(Value::Int(identity));
    }
    let mut acc = as_num(name, &args[0])?;
    for arg in &args[1..] {
        acc = match (acc, as_num(name, arg)?) {
            (Num::Int(a), Num::Int(b)) => Num::Int(int_op(a, b).ok_or_else(|| overflow(name))?),
            (Num::Int(a), Num::Float(b)) => Num::Float(float_op(a as f64, b)),
            (Num::Float(a), Num::Int(b)) => Num::Float(float_op(a, b as f64)),
            (Num::Float(a), Num::Float(b)) => Num::Float(float_op(a, b)),
        };
    }
    Ok(match acc {
        Num::Int(n) => Value::Int(n),
        Num::Float(f) => Value::Float(f),
    })
}

fn add(args: &[Value]) -> Result<Value, SableError> {
    fold("+", args, 0, i64::checked_add, |a, b| a + b)
}

fn sub(args: &[Value]) -> Result<Value, SableError> {
    check_min("-", args, 1)?;
    if args.len() == 1 {
        return match as_num("-", &args[0])? {
            Num::Int(n) => n.checked_neg().map(Value::Int).ok_or_else(|| overflow("-")),
            Num::Float(f) => Ok(Value::Float(-f)),
        };
    }
    fold("-", args, 0, i64::checked_sub, |a, b| a - b)
}

fn mul(args: &[Value]) -> Result<Value, SableError> {
    fold("*", args, 1, i64::checked_mul, |a, b| a * b)
}

fn div(args: &[Value]) -> Result<Value, SableError> {
    check_min("/", args, 1)?;
    let items: Vec<Value>;
    let args = if args.len() == 1 {
        items = vec![Value::Int(1), args[0].clone()];
        &items[..]
    } else {
        args
    };
    let mut acc = as_num("/", &args[0])?;
    for arg in &args[1..] {
        let rhs = as_num("/", arg)?;
        if matches!(rhs, Num::Int(0)) {
            return Err(SableError::value_err("divide by zero"));
        }
        acc = match (acc, rhs) {
            (Num::Int(a), Num::Int(b)) => {
                if a % b == 0 {
                    Num::Int(a / b)
                } else {
                    Num::Float(a as f64 / b as f64)
                }
            }
            (Num::Int(a), Num::Float(b)) => Num::Float(a as f64 / b),
            (Num::Float(a), Num::Int(b)) => Num::Float(a / b as f64),
            (Num::Float(a), Num::Float(b)) => Num::Float(a / b),
        };
    }
    Ok(match acc {
        Num::Int(n) => Value::Int(n),
        Num::Float(f) => Value::Float(f),
    })
}

fn quot(args: &[Value]) -> Result<Value, SableError> {
    check_exact("quot", args, 2)?;
    match (as_num("quot", &args[0])?, as_num("quot", &args[1])?) {
        (Num::Int(_), Num::Int(0)) => Err(SableError::value_err("divide by zero")),
        (Num::Int(a), Num::Int(b)) => Ok(Value::Int(a.wrapping_div(b))),
        (a, b) => {
            let (a, b) = (num_f(a), num_f(b));
            Ok(Value::Float((a / b).trunc()))
        }
    }
}

fn rem(args: &[Value]) -> Result<Value, SableError> {
    check_exact("rem", args, 2)?;
    match (as_num("rem", &args[0])?, as_num("rem", &args[1])?) {
        (Num::Int(_), Num::Int(0)) => Err(SableError::value_err("divide by zero")),
        (Num::Int(a), Num::Int(b)) => Ok(Value::Int(a.wrapping_rem(b))),
        (a, b) => {
            let (a, b) = (num_f(a), num_f(b));
            Ok(Value::Float(a % b))
        }
    }
}

fn modulo(args: &[Value]) -> Result<Value, SableError> {
    check_exact("mod", args, 2)?;
    match (as_num("mod", &args[0])?, as_num("mod", &args[1])?) {
        (Num::Int(_), Num::Int(0)) => Err(SableError::value_err("divide by zero")),
        (Num::Int(a), Num::Int(b)) => Ok(Value::Int(a.rem_euclid(b))),
        (a, b) => {
            let (a, b) = (num_f(a), num_f(b));
            Ok(Value::Float(a - b * (a / b).floor()))
        }
    }
}

fn num_f(n: Num) -> f64 {
    match n {
        Num::Int(i) => i as f64,
        Num::Float(f) => f,
    }
}

fn inc(args: &[Value]) -> Result<Value, SableError> {
    check_exact("inc", args, 1)?;
    add(&[args[0].clone(), Value::Int(1)])
}

fn dec(args: &[Value]) -> Result<Value, SableError> {
    check_exact("dec", args, 1)?;
    sub(&[args[0].clone(), Value::Int(1)])
}

fn pick(name: &'static str, args: &[Value], want: Ordering) -> Result<Value, SableError> {
    check_min(name, args, 1)?;
    let mut best = args[0].clone();
    for arg in &args[1..] {
        as_num(name, arg)?;
        if value_compare(arg, &best)? == want {
            best = arg.clone();
        }
    }
    Ok(best)
}

fn max(args: &[Value]) -> Result<Value, SableError> {
    pick("max", args, Ordering::Greater)
}

fn min(args: &[Value]) -> Result<Value, SableError> {
    pick("min", args, Ordering::Less)
}

fn abs(args: &[Value]) -> Result<Value, SableError> {
    check_exact("abs", args, 1)?;
    match as_num("abs", &args[0])? {
        Num::Int(n) => n.checked_abs().map(Value::Int).ok_or_else(|| overflow("abs")),
        Num::Float(f) => Ok(Value::Float(f.abs())),
    }
}

fn floor(args: &[Value]) -> Result<Value, SableError> {
    check_exact("floor", args, 1)?;
    match as_num("floor", &args[0])? {
        Num::Int(n) => Ok(Value::Int(n)),
        Num::Float(f) => Ok(Value::Float(f.floor())),
    }
}

fn ceil(args: &[Value]) -> Result<Value, SableError> {
    check_exact("ceil", args, 1)?;
    match as_num("ceil", &args[0])? {
        Num::Int(n) => Ok(Value::Int(n)),
        Num::Float(f) => Ok(Value::Float(f.ceil())),
    }
}

fn sqrt(args: &[Value]) -> Result<Value, SableError> {
    check_exact("sqrt", args, 1)?;
    Ok(Value::Float(num_f(as_num("sqrt", &args[0])?).sqrt()))
}

fn pow(args: &[Value]) -> Result<Value, SableError> {
    check_exact("pow", args, 2)?;
    let base = num_f(as_num("pow", &args[0])?);
    let exp = num_f(as_num("pow", &args[1])?);
    Ok(Value::Float(base.powf(exp)))
}

fn eq(args: &[Value]) -> Result<Value, SableError> {
    check_min("=", args, 1)?;
    Ok(Value::Bool(
        args.windows(2).all(|w| value_equals(&w[0], &w[1])),
    ))
}

fn not_eq(args: &[Value]) -> Result<Value, SableError> {
    let e = eq(args)?;
    Ok(Value::Bool(!e.is_truthy()))
}

fn num_eq(args: &[Value]) -> Result<Value, SableError> {
    check_min("==", args, 1)?;
    for w in args.windows(2) {
        if !numeric_equals(&w[0], &w[1])? {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

fn chain(
    name: &'static str,
    args: &[Value],
    accept: fn(Ordering) -> bool,
) -> Result<Value, SableError> {
    check_min(name, args, 1)?;
    for w in args.windows(2) {
        as_num(name, &w[0])?;
        as_num(name, &w[1])?;
        if !accept(value_compare(&w[0], &w[1])?) {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

fn lt(args: &[Value]) -> Result<Value, SableError> {
    chain("<", args, |o| o == Ordering::Less)
}

fn lte(args: &[Value]) -> Result<Value, SableError> {
    chain("<=", args, |o| o != Ordering::Greater)
}

fn gt(args: &[Value]) -> Result<Value, SableError> {
    chain(">", args, |o| o == Ordering::Greater)
}

fn gte(args: &[Value]) -> Result<Value, SableError> {
    chain(">=", args, |o| o != Ordering::Less)
}

fn compare(args: &[Value]) -> Result<Value, SableError> {
    check_exact("compare", args, 2)?;
    Ok(Value::Int(match value_compare(&args[0], &args[1])? {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }))
}

fn zero_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("zero?", args, 1)?;
    Ok(Value::Bool(match as_num("zero?", &args[0])? {
        Num::Int(n) => n == 0,
        Num::Float(f) => f == 0.0,
    }))
}

fn pos_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("pos?", args, 1)?;
    Ok(Value::Bool(match as_num("pos?", &args[0])? {
        Num::Int(n) => n > 0,
        Num::Float(f) => f > 0.0,
    }))
}

fn neg_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("neg?", args, 1)?;
    Ok(Value::Bool(match as_num("neg?", &args[0])? {
        Num::Int(n) => n < 0,
        Num::Float(f) => f < 0.0,
    }))
}

fn even_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("even?", args, 1)?;
    match &args[0] {
        Value::Int(n) => Ok(Value::Bool(n % 2 == 0)),
        other => Err(SableError::type_err(format!(
            "even? expects an integer, got {}",
            other.type_name()
        ))),
    }
}

fn odd_p(args: &[Value]) -> Result<Value, SableError> {
    let e = even_p(args)?;
    Ok(Value::Bool(!e.is_truthy()))
}

fn number_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("number?", args, 1)?;
    Ok(Value::Bool(matches!(
        args[0],
        Value::Int(_) | Value::Float(_)
    )))
}

fn integer_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("integer?", args, 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Int(_))))
}

fn float_p(args: &[Value]) -> Result<Value, SableError> {
    check_exact("float?", args, 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Float(_))))
}

fn to_int(args: &[Value]) -> Result<Value, SableError> {
    check_exact("int", args, 1)?;
    match &args[0] {
        Value::Int(n) => Ok(Value::Int(*n)),
        Value::Float(f) => Ok(Value::Int(*f as i64)),
        Value::Char(c) => Ok(Value::Int(*c as i64)),
        other => Err(SableError::type_err(format!(
            "int expects a number or char, got {}",
            other.type_name()
        ))),
    }
}

fn to_double(args: &[Value]) -> Result<Value, SableError> {
    check_exact("double", args, 1)?;
    match as_num("double", &args[0])? {
        Num::Int(n) => Ok(Value::Float(n as f64)),
        Num::Float(f) => Ok(Value::Float(f)),
    }
}

fn rand_int(args: &[Value]) -> Result<Value, SableError> {
    check_range("rand-int", args, 1, 1)?;
    let n = super::int_arg("rand-int", args, 0)?;
    if n <= 0 {
        return Ok(Value::Int(0));
    }
    // Clock-derived; good enough for shuffling, not for cryptography
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as i64)
        .unwrap_or(0);
    Ok(Value::Int(nanos.rem_euclid(n)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_contagion_and_identity() {
        assert!(matches!(add(&[]).unwrap(), Value::Int(0)));
        assert!(matches!(
            add(&[Value::Int(1), Value::Int(2)]).unwrap(),
            Value::Int(3)
        ));
        assert!(matches!(
            add(&[Value::Int(1), Value::Float(0.5)]).unwrap(),
            Value::Float(_)
        ));
        assert!(add(&[Value::Int(i64::MAX), Value::Int(1)]).is_err());
    }

    #[test]
    fn test_division_exact_vs_inexact() {
        assert!(matches!(
            div(&[Value::Int(6), Value::Int(3)]).unwrap(),
            Value::Int(2)
        ));
        match div(&[Value::Int(1), Value::Int(2)]).unwrap() {
            Value::Float(f) => assert!((f - 0.5).abs() < 1e-12),
            other => panic!("unexpected {:?}", other),
        }
        assert!(div(&[Value::Int(1), Value::Int(0)]).is_err());
    }

    #[test]
    fn test_mod_floors_rem_truncates() {
        assert!(matches!(
            modulo(&[Value::Int(-7), Value::Int(3)]).unwrap(),
            Value::Int(2)
        ));
        assert!(matches!(
            rem(&[Value::Int(-7), Value::Int(3)]).unwrap(),
            Value::Int(-1)
        ));
    }

    #[test]
    fn test_comparison_chains() {
        let t = lt(&[Value::Int(1), Value::Int(2), Value::Int(3)]).unwrap();
        assert!(t.is_truthy());
        let f = lt(&[Value::Int(1), Value::Int(3), Value::Int(2)]).unwrap();
        assert!(!f.is_truthy());
        assert!(lt(&[Value::Int(1), Value::string("x")]).is_err());
    }

    #[test]
    fn test_structural_vs_numeric_equality() {
        assert!(!eq(&[Value::Int(1), Value::Float(1.0)]).unwrap().is_truthy());
        assert!(num_eq(&[Value::Int(1), Value::Float(1.0)]).unwrap().is_truthy());
    }
}
