//! `arith`: a small demo application.
//!
//! - `add(a, b)` returns `a + b`
//! - `add3(a, b)` is the same task, delayed by three seconds
//! - `addn(a, b)` runs in-process instead of being submitted

use anyhow::{anyhow, bail};
use serde_json::{Map, Value};

use super::App;
use crate::config::TaskOptions;
use crate::registry::handler_fn;

pub const NAME: &str = "arith";

pub fn app() -> App {
    App::new(NAME, |manager| {
        manager.register("add", handler_fn(add), TaskOptions::new())?;
        manager.register("add3", handler_fn(add), TaskOptions::new().with_delay(3))?;
        manager.register("addn", handler_fn(add), TaskOptions::new().with_debug(true))?;
        Ok(())
    })
}

/// Adds two numbers given positionally or as `a` and `b`.
fn add(args: &[Value], kwargs: &Map<String, Value>) -> anyhow::Result<Value> {
    let operand = |index: usize, key: &str| {
        args.get(index)
            .or_else(|| kwargs.get(key))
            .ok_or_else(|| anyhow!("missing argument '{}'", key))
    };
    let (a, b) = (operand(0, "a")?, operand(1, "b")?);

    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return a
            .checked_add(b)
            .map(Value::from)
            .ok_or_else(|| anyhow!("{} + {} overflows", a, b));
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => Ok(Value::from(a + b)),
        _ => bail!("cannot add {} and {}", a, b),
    }
}
