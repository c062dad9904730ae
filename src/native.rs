// File: src/native.rs
//
// The native function registry: host-provided callables programs can invoke
// like any other function. Kept deliberately small — just the handful the
// language actually needs reflection and timing hooks for.

use crate::value::{NativeFunction, Value};
use crate::vm::Vm;
use rand::Rng;
use std::time::Instant;

/// Install the five built-in natives into a freshly constructed VM.
pub fn install_defaults(vm: &mut Vm) {
    let start = Instant::now();
    vm.register_native("clock", 0, move |_args| Ok(Value::Number(start.elapsed().as_secs_f64())));

    vm.register_native("random", 2, |args| {
        let lo = expect_number(&args[0], "random")?;
        let hi = expect_number(&args[1], "random")?;
        if !(lo < hi) {
            return Err("random: lower bound must be less than upper bound".to_string());
        }
        let mut rng = rand::thread_rng();
        Ok(Value::Number(rng.gen_range(lo as i64..hi as i64) as f64))
    });

    vm.register_native("hasfield", 2, |args| {
        let instance = expect_instance(&args[0], "hasfield")?;
        let name = expect_string(&args[1], "hasfield")?;
        Ok(Value::Bool(instance.borrow().fields.contains_key(&name)))
    });

    vm.register_native("setfield", 3, |args| {
        let instance = expect_instance(&args[0], "setfield")?;
        let name = expect_string(&args[1], "setfield")?;
        let value = args[2].clone();
        instance.borrow_mut().fields.insert(name, value);
        Ok(Value::Nil)
    });

    vm.register_native("deletefield", 2, |args| {
        let instance = expect_instance(&args[0], "deletefield")?;
        let name = expect_string(&args[1], "deletefield")?;
        instance.borrow_mut().fields.remove(&name);
        Ok(Value::Nil)
    });
}

fn expect_number(v: &Value, who: &str) -> Result<f64, String> {
    match v {
        Value::Number(n) => Ok(*n),
        other => Err(format!("{who}: expected a number, got {}", other.type_name())),
    }
}

fn expect_string(v: &Value, who: &str) -> Result<crate::intern::StringHandle, String> {
    match v {
        Value::Str(s) => Ok(s.clone()),
        other => Err(format!("{who}: expected a string, got {}", other.type_name())),
    }
}

#[allow(clippy::type_complexity)]
fn expect_instance(
    v: &Value,
    who: &str,
) -> Result<std::rc::Rc<std::cell::RefCell<crate::value::Instance>>, String> {
    match v {
        Value::Instance(i) => Ok(i.clone()),
        other => Err(format!("{who}: expected an instance, got {}", other.type_name())),
    }
}

impl NativeFunction {
    pub fn new(
        name: crate::intern::StringHandle,
        arity: u8,
        func: impl Fn(&[Value]) -> Result<Value, String> + 'static,
    ) -> Self {
        Self { name, arity, func: std::rc::Rc::new(func) }
    }
}
