//! Built-in EDL functions.

use std::time::Duration;

use super::value::Value;
use super::{Clock, Emission, InterpreterContext, RunMode, fatal};
use crate::device::DeviceSet;
use crate::error::{InterpretError, InterpretResult};
use crate::program::Location;

/// Name, minimum and maximum argument count of every built-in.
const BUILTINS: &[(&str, usize, Option<usize>)] = &[
    ("print", 1, None),
    ("wait", 1, Some(1)),
    ("time", 0, Some(0)),
    ("int", 1, Some(1)),
    ("float", 1, Some(1)),
    ("abs", 1, Some(1)),
    ("sqrt", 1, Some(1)),
    ("size", 1, Some(1)),
    ("record", 2, Some(2)),
    ("abort", 0, Some(0)),
];

/// Argument count bounds of a built-in, if `name` is one.
pub fn arity(name: &str) -> Option<(usize, Option<usize>)> {
    BUILTINS
        .iter()
        .find(|(builtin, _, _)| *builtin == name)
        .map(|&(_, min, max)| (min, max))
}

/// Check-mode validation of a call: the function must exist and, for
/// built-ins, receive an acceptable number of arguments.
pub fn check_call(
    devices: &DeviceSet,
    name: &str,
    argc: usize,
    location: &Location,
) -> InterpretResult<()> {
    match arity(name) {
        Some((min, max)) if argc < min || max.is_some_and(|max| argc > max) => {
            Err(InterpretError::Syntax {
                message: format!("wrong number of arguments ({argc}) for '{name}'"),
                location: location.clone(),
            })
        }
        Some(_) => Ok(()),
        None if devices.has_function(name) => Ok(()),
        None => Err(InterpretError::Syntax {
            message: format!("unknown function '{name}'"),
            location: location.clone(),
        }),
    }
}

fn number(name: &str, value: &Value, location: &Location) -> InterpretResult<f64> {
    value.as_f64().ok_or_else(|| {
        fatal(
            format!("{name}() expects a number, found {}", value.type_name()),
            location,
        )
    })
}

impl InterpreterContext<'_> {
    /// Call a built-in. Returns `None` if `name` is not a built-in.
    pub(crate) fn call_builtin(
        &mut self,
        name: &str,
        args: &[Value],
        location: &Location,
    ) -> Option<InterpretResult<Value>> {
        let (min, max) = arity(name)?;
        if args.len() < min || max.is_some_and(|max| args.len() > max) {
            return Some(Err(fatal(
                format!("wrong number of arguments ({}) for '{name}'", args.len()),
                location,
            )));
        }
        Some(match name {
            "print" => self.print(args, location),
            "wait" => self.wait(&args[0], location),
            "time" => Ok(Value::Float(self.clock.elapsed().as_secs_f64())),
            "int" => match &args[0] {
                Value::Int(v) => Ok(Value::Int(*v)),
                other => number(name, other, location).map(|v| Value::Int(v.trunc() as i64)),
            },
            "float" => number(name, &args[0], location).map(Value::Float),
            "abs" => match &args[0] {
                Value::Int(v) => v
                    .checked_abs()
                    .map(Value::Int)
                    .ok_or_else(|| fatal("integer overflow in abs()", location)),
                other => number(name, other, location).map(|v| Value::Float(v.abs())),
            },
            "sqrt" => match number(name, &args[0], location) {
                Ok(v) if v < 0.0 => Err(fatal(
                    format!("sqrt() of negative number {v}"),
                    location,
                )),
                Ok(v) => Ok(Value::Float(v.sqrt())),
                Err(err) => Err(err),
            },
            "size" => match &args[0] {
                Value::Array(items) => Ok(Value::Int(items.len() as i64)),
                other => Err(fatal(
                    format!("size() expects an array, found {}", other.type_name()),
                    location,
                )),
            },
            "record" => self.record(&args[0], &args[1], location),
            "abort" => {
                self.abort_requested = true;
                Ok(Value::Int(0))
            }
            _ => return None,
        })
    }

    /// `print(fmt, args...)`: every `#` in `fmt` is replaced by the next
    /// argument.
    fn print(&mut self, args: &[Value], location: &Location) -> InterpretResult<Value> {
        let Value::Str(format) = &args[0] else {
            return Err(fatal(
                format!(
                    "print() expects a format string, found {}",
                    args[0].type_name()
                ),
                location,
            ));
        };

        let mut rest = args[1..].iter();
        let mut text = String::with_capacity(format.len());
        let mut missing = 0;
        for ch in format.chars() {
            if ch != '#' {
                text.push(ch);
                continue;
            }
            match rest.next() {
                Some(arg) => text.push_str(&arg.to_string()),
                None => {
                    missing += 1;
                    text.push('#');
                }
            }
        }
        let unused = rest.count();
        if missing > 0 || unused > 0 {
            self.diagnostics.warn(
                format!("print(): {missing} placeholder(s) without argument, {unused} argument(s) unused"),
                location,
            );
        }

        tracing::debug!(%text, "print");
        self.sink.emit(Emission::Print { text })?;
        Ok(Value::Int(0))
    }

    /// `wait(seconds)`: interruptible in the real run, simulated in the test
    /// run.
    fn wait(&mut self, seconds: &Value, location: &Location) -> InterpretResult<Value> {
        let seconds = number("wait", seconds, location)?;
        if seconds < 0.0 {
            self.diagnostics
                .warn(format!("negative wait time {seconds} ignored"), location);
            return Ok(Value::Int(0));
        }
        let duration = Duration::try_from_secs_f64(seconds)
            .map_err(|_| fatal(format!("invalid wait time {seconds}"), location))?;

        match (&mut self.clock, self.mode) {
            (Clock::Simulated(elapsed), RunMode::Test) => {
                *elapsed += duration;
                Ok(Value::Int(0))
            }
            _ => {
                let interrupted = self.quit.wait_timeout(duration);
                Ok(Value::Int(interrupted as i64))
            }
        }
    }

    /// `record(name, value)`: send a named data point to the supervisor.
    fn record(&mut self, name: &Value, value: &Value, location: &Location) -> InterpretResult<Value> {
        let Value::Str(name) = name else {
            return Err(fatal(
                format!("record() expects a name string, found {}", name.type_name()),
                location,
            ));
        };
        if matches!(value, Value::Str(_)) {
            return Err(fatal("record() expects a number or an array", location));
        }
        let elapsed = self.clock.elapsed().as_secs_f64();
        self.sink.emit(Emission::Record {
            name: name.clone(),
            value: value.clone(),
            elapsed,
        })?;
        Ok(Value::Int(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::{RunEnd, RunMode};
    use crate::program::{Lexer, Program, ValueStack, build, link};

    fn program(src: &str) -> Program {
        let mut lexer = Lexer::new("builtins.edl", src);
        let mut stack = ValueStack::new();
        let mut program = build(&mut lexer, &mut stack).unwrap();
        link(&mut program).unwrap();
        program
    }

    #[test]
    fn test_arity_checks() {
        let devices = DeviceSet::new();
        let loc = Location::new("b.edl", 1);
        assert!(check_call(&devices, "print", 3, &loc).is_ok());
        assert!(check_call(&devices, "print", 0, &loc).is_err());
        assert!(check_call(&devices, "time", 1, &loc).is_err());
        assert!(check_call(&devices, "frobnicate", 1, &loc).is_err());
    }

    #[test]
    fn test_print_record_and_simulated_time() {
        let mut program =
            program("x = 3; print(\"x = #, t = #\", x, time()); wait(1.5); record(\"v\", sqrt(16));");
        let mut devices = DeviceSet::new();
        let mut out = Vec::new();
        let mut ctx = InterpreterContext::new(&mut program, &mut devices, &mut out, RunMode::Test);
        assert_eq!(ctx.run().unwrap(), RunEnd::Completed);
        assert_eq!(ctx.elapsed(), Duration::from_millis(1500));
        assert!(ctx.diagnostics().is_clean());
        assert_eq!(
            out,
            vec![
                Emission::Print {
                    text: "x = 3, t = 0".to_string()
                },
                Emission::Record {
                    name: "v".to_string(),
                    value: Value::Float(4.0),
                    elapsed: 1.5,
                },
            ]
        );
    }

    #[test]
    fn test_abort_stops_run() {
        let mut program = program("x = 1; abort(); x = 2;");
        let mut devices = DeviceSet::new();
        let mut out = Vec::new();
        let mut ctx = InterpreterContext::new(&mut program, &mut devices, &mut out, RunMode::Test);
        assert_eq!(ctx.run().unwrap(), RunEnd::Stopped);
        assert_eq!(ctx.variable("x"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_conversions() {
        let mut program = program("a = int(2.9); b = float(2); c = abs(-3); d = int(-2.5);");
        let mut devices = DeviceSet::new();
        let mut out = Vec::new();
        let mut ctx = InterpreterContext::new(&mut program, &mut devices, &mut out, RunMode::Test);
        ctx.run().unwrap();
        assert_eq!(ctx.variable("a"), Some(&Value::Int(2)));
        assert_eq!(ctx.variable("b"), Some(&Value::Float(2.0)));
        assert_eq!(ctx.variable("c"), Some(&Value::Int(3)));
        assert_eq!(ctx.variable("d"), Some(&Value::Int(-2)));
    }
}
