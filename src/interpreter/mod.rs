//! Token-dispatch interpreter for linked EDL programs.
//!
//! One dispatch table drives three phases. The syntax check walks the whole
//! buffer through the grammar pass without evaluating anything so that
//! errors in branches a run would never take still surface. The test run
//! executes the program against simulated time and hardware inside the
//! supervising process. The real run executes it inside the worker process,
//! observing the [`QuitRequest`] between dispatches.

/// Built-in EDL functions.
pub mod builtins;
/// Condition evaluation for loop and conditional headers.
pub mod condition;
/// Statement and expression grammar pass.
pub mod grammar;
/// Cancellation token shared with the worker's control channel.
pub mod quit;
/// Runtime values and arithmetic.
pub mod value;

pub use grammar::{AssignOp, Expr, Statement, Stmt, parse_expression, parse_statement};
pub use quit::QuitRequest;
pub use value::{BinaryOp, UnaryOp, Value};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::mem;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::device::DeviceSet;
use crate::diagnostics::Diagnostics;
use crate::error::{InterpretError, InterpretResult, Result};
use crate::program::{Location, LoopCounter, Program, TokenKind};

/// Which kind of run the interpreter performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    /// Dry run with simulated clock and hardware
    Test,
    /// Real run inside the worker process
    Real,
}

/// How a test or real run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunEnd {
    /// Cursor ran off the end of the buffer
    Completed,
    /// A stop was requested (or `abort()` called)
    Stopped,
}

/// Output produced by a running script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Emission {
    /// Text produced by `print`
    Print {
        /// Formatted line
        text: String,
    },
    /// Named data point produced by `record`
    Record {
        /// Data set name
        name: String,
        /// Recorded value
        value: Value,
        /// Seconds since the run started
        elapsed: f64,
    },
}

/// Destination for [`Emission`]s.
pub trait Sink {
    /// Deliver one emission.
    fn emit(&mut self, emission: Emission) -> io::Result<()>;
}

impl Sink for Vec<Emission> {
    fn emit(&mut self, emission: Emission) -> io::Result<()> {
        self.push(emission);
        Ok(())
    }
}

/// Host event loop hook called periodically during the test run.
///
/// Returns `true` when the user asked to stop.
pub trait EventPump {
    /// Process pending host events.
    fn pump(&mut self) -> bool;
}

impl<F: FnMut() -> bool> EventPump for F {
    fn pump(&mut self) -> bool {
        self()
    }
}

#[derive(Debug, Clone, Copy)]
enum Clock {
    Simulated(Duration),
    Real(Instant),
}

impl Clock {
    fn for_mode(mode: RunMode) -> Self {
        match mode {
            RunMode::Test => Clock::Simulated(Duration::ZERO),
            RunMode::Real => Clock::Real(Instant::now()),
        }
    }

    fn elapsed(&self) -> Duration {
        match self {
            Clock::Simulated(elapsed) => *elapsed,
            Clock::Real(start) => start.elapsed(),
        }
    }
}

/// Execution state for one test or real run.
///
/// Owns the cursor and the variables; borrows the program buffer (whose
/// loop bookkeeping it updates), the device set, and the data sink.
pub struct InterpreterContext<'a> {
    program: &'a mut Program,
    cursor: usize,
    mode: RunMode,
    variables: HashMap<String, Value>,
    devices: &'a mut DeviceSet,
    sink: &'a mut dyn Sink,
    clock: Clock,
    quit: QuitRequest,
    pump: Option<&'a mut dyn EventPump>,
    yield_interval: u64,
    dispatched: u64,
    abort_requested: bool,
    on_stop_entered: bool,
    diagnostics: Diagnostics,
}

impl<'a> InterpreterContext<'a> {
    /// Create a context positioned at the start of `program`.
    pub fn new(
        program: &'a mut Program,
        devices: &'a mut DeviceSet,
        sink: &'a mut dyn Sink,
        mode: RunMode,
    ) -> Self {
        Self {
            program,
            cursor: 0,
            mode,
            variables: HashMap::new(),
            devices,
            sink,
            clock: Clock::for_mode(mode),
            quit: QuitRequest::new(),
            pump: None,
            yield_interval: 0,
            dispatched: 0,
            abort_requested: false,
            on_stop_entered: false,
            diagnostics: Diagnostics::new(),
        }
    }

    /// Use `quit` as the cancellation token.
    pub fn with_quit(mut self, quit: QuitRequest) -> Self {
        self.quit = quit;
        self
    }

    /// Call `pump` every `interval` dispatched tokens (test run only).
    pub fn with_pump(mut self, pump: &'a mut dyn EventPump, interval: u64) -> Self {
        self.pump = Some(pump);
        self.yield_interval = interval;
        self
    }

    /// Run mode of this context.
    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// Current value of a variable.
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Number of tokens dispatched so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Run time as seen by the script.
    pub fn elapsed(&self) -> Duration {
        self.clock.elapsed()
    }

    /// Diagnostics reported so far.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Take the diagnostics reported so far.
    pub fn take_diagnostics(&mut self) -> Diagnostics {
        mem::take(&mut self.diagnostics)
    }

    /// Dispatch tokens from the start of the buffer until it is exhausted or
    /// the run is stopped.
    pub fn run(&mut self) -> InterpretResult<RunEnd> {
        self.program.reset_run_state();
        self.cursor = 0;
        self.clock = Clock::for_mode(self.mode);
        info!(mode = ?self.mode, tokens = self.program.len(), "run started");

        loop {
            if self.abort_requested {
                info!("run aborted by script");
                return Ok(RunEnd::Stopped);
            }
            if self.quit.is_requested() {
                match (self.mode, self.program.on_stop()) {
                    (RunMode::Real, Some(target)) => {
                        info!(target, "stop requested, entering ON_STOP section");
                        self.quit.stop_listening();
                        self.on_stop_entered = true;
                        self.cursor = target;
                    }
                    _ => {
                        info!("stop requested");
                        return Ok(RunEnd::Stopped);
                    }
                }
            }
            if self.cursor >= self.program.len() {
                break;
            }

            self.dispatch()?;
            self.dispatched += 1;

            if self.yield_interval > 0 && self.dispatched % self.yield_interval == 0 {
                if let Some(pump) = self.pump.as_mut() {
                    if pump.pump() {
                        self.quit.request();
                    }
                }
            }
        }

        debug!(dispatched = self.dispatched, "end of program reached");
        Ok(if self.on_stop_entered {
            RunEnd::Stopped
        } else {
            RunEnd::Completed
        })
    }

    fn location(&self, index: usize) -> Location {
        self.program
            .get(index)
            .map(|t| t.location.clone())
            .unwrap_or_else(|| Location::new("<program>", 0))
    }

    fn link(&self, index: usize, link: Option<usize>, what: &str) -> InterpretResult<usize> {
        link.ok_or_else(|| {
            InterpretError::Corrupt(format!(
                "token {index} ({}) has no {what} link",
                self.program
                    .get(index)
                    .map(|t| t.kind.describe())
                    .unwrap_or("?")
            ))
        })
    }

    fn body_start(&self, index: usize) -> InterpretResult<usize> {
        self.link(index, self.program.get(index).and_then(|t| t.body_start), "body")
    }

    fn successor(&self, index: usize) -> InterpretResult<usize> {
        self.link(index, self.program.get(index).and_then(|t| t.successor), "successor")
    }

    fn loop_header(&self, index: usize) -> InterpretResult<usize> {
        self.link(index, self.program.get(index).and_then(|t| t.loop_header), "loop")
    }

    /// Leave the loop at `header`, forgetting its iteration state.
    fn leave_loop(&mut self, header: usize) -> InterpretResult<()> {
        let successor = self.successor(header)?;
        if let Some(token) = self.program.tokens_mut().get_mut(header) {
            token.reset_iteration();
        }
        self.cursor = successor;
        Ok(())
    }

    fn enter_body(&mut self, header: usize) -> InterpretResult<()> {
        let body = self.body_start(header)?;
        if let Some(token) = self.program.tokens_mut().get_mut(header) {
            token.entered = true;
        }
        self.cursor = body;
        Ok(())
    }

    fn dispatch(&mut self) -> InterpretResult<()> {
        let index = self.cursor;
        let kind = self
            .program
            .get(index)
            .map(|t| t.kind)
            .ok_or_else(|| InterpretError::Corrupt(format!("cursor {index} out of range")))?;

        match kind {
            TokenKind::RBrace => self.cursor = self.successor(index)?,
            TokenKind::While | TokenKind::Until => {
                let holds = self.test_condition(index)?;
                if holds == (kind == TokenKind::While) {
                    self.enter_body(index)?;
                } else {
                    self.leave_loop(index)?;
                }
            }
            TokenKind::Repeat => self.dispatch_repeat(index)?,
            TokenKind::For => self.dispatch_for(index)?,
            TokenKind::Forever => self.enter_body(index)?,
            TokenKind::If | TokenKind::Unless => {
                let holds = self.test_condition(index)?;
                self.cursor = if holds == (kind == TokenKind::If) {
                    self.body_start(index)?
                } else {
                    self.successor(index)?
                };
            }
            TokenKind::Break => {
                let header = self.loop_header(index)?;
                self.leave_loop(header)?;
            }
            TokenKind::Next => self.cursor = self.loop_header(index)?,
            TokenKind::Else | TokenKind::LBrace => self.cursor = index + 1,
            TokenKind::OnStop => {
                debug!("entering ON_STOP section");
                self.quit.stop_listening();
                self.cursor = index + 1;
            }
            _ => {
                let statement = parse_statement(self.program.tokens(), index)?;
                self.cursor = statement.next;
                self.execute(statement)?;
            }
        }
        Ok(())
    }

    fn dispatch_repeat(&mut self, header: usize) -> InterpretResult<()> {
        if !self.program.tokens()[header].entered {
            let max = self.repeat_count(header)?;
            let token = &mut self.program.tokens_mut()[header];
            token.counter = LoopCounter::Repeat { count: 0, max };
            token.entered = true;
        }

        let token = &mut self.program.tokens_mut()[header];
        let again = match &mut token.counter {
            LoopCounter::Repeat { count, max } => {
                *count += 1;
                *count <= *max
            }
            _ => {
                return Err(InterpretError::Corrupt(format!(
                    "repeat header {header} lost its counter"
                )));
            }
        };
        if again {
            self.enter_body(header)
        } else {
            self.leave_loop(header)
        }
    }

    fn dispatch_for(&mut self, header: usize) -> InterpretResult<()> {
        let location = self.location(header);
        if self.program.tokens()[header].entered {
            self.advance_for(header, &location)?;
        } else {
            let counter = self.enter_for(header)?;
            let token = &mut self.program.tokens_mut()[header];
            token.counter = counter;
            token.entered = true;
        }

        if self.for_continues(header, &location)? {
            self.enter_body(header)
        } else {
            self.leave_loop(header)
        }
    }

    fn execute(&mut self, statement: Statement) -> InterpretResult<()> {
        let location = statement.location;
        match statement.stmt {
            Stmt::Empty => Ok(()),
            Stmt::Expr(expr) => self.eval(&expr, &location).map(drop),
            Stmt::Assign {
                name,
                index: None,
                op,
                value,
            } => {
                let rhs = self.eval(&value, &location)?;
                let current = self.variables.get(&name).cloned();
                let new = match op.binary() {
                    None => rhs,
                    Some(binary_op) => {
                        let current = current.clone().ok_or_else(|| undefined(&name, &location))?;
                        value::binary(binary_op, current, rhs).map_err(|m| fatal(m, &location))?
                    }
                };
                let stored = self.coerce(&name, current.as_ref(), new, &location)?;
                self.variables.insert(name, stored);
                Ok(())
            }
            Stmt::Assign {
                name,
                index: Some(index),
                op,
                value,
            } => {
                let position = self.eval(&index, &location)?;
                let rhs = self.eval(&value, &location)?;
                let Some(Value::Array(items)) = self.variables.get(&name) else {
                    return Err(fatal(format!("'{name}' is not an array"), &location));
                };
                let slot = element_index(&position, items.len(), &location)?;
                let current = items[slot].clone();
                let new = match op.binary() {
                    None => rhs,
                    Some(binary_op) => value::binary(binary_op, current.clone(), rhs)
                        .map_err(|m| fatal(m, &location))?,
                };
                let element = format!("{name}[{slot}]");
                let stored = self.coerce(&element, Some(&current), new, &location)?;
                if let Some(Value::Array(items)) = self.variables.get_mut(&name) {
                    items[slot] = stored;
                }
                Ok(())
            }
        }
    }

    /// Convert a value about to be stored into `target` to the target's type.
    fn coerce(
        &mut self,
        target: &str,
        current: Option<&Value>,
        new: Value,
        location: &Location,
    ) -> InterpretResult<Value> {
        match (current, new) {
            (None, new) => Ok(new),
            (Some(Value::Int(_)), Value::Float(v)) => {
                self.diagnostics.warn(
                    format!("float value {v} assigned to integer '{target}' is truncated"),
                    location,
                );
                Ok(Value::Int(v.trunc() as i64))
            }
            (Some(Value::Float(_)), Value::Int(v)) => Ok(Value::Float(v as f64)),
            (Some(current), new) if mem::discriminant(current) == mem::discriminant(&new) => {
                Ok(new)
            }
            (Some(current), new) => Err(fatal(
                format!(
                    "cannot assign {} to {} '{target}'",
                    new.type_name(),
                    current.type_name()
                ),
                location,
            )),
        }
    }

    /// Evaluate an expression.
    pub(crate) fn eval(&mut self, expr: &Expr, location: &Location) -> InterpretResult<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Variable(name) => self
                .variables
                .get(name)
                .cloned()
                .ok_or_else(|| undefined(name, location)),
            Expr::Array(items) => items
                .iter()
                .map(|item| self.eval(item, location))
                .collect::<InterpretResult<Vec<_>>>()
                .map(Value::Array),
            Expr::Index { target, index } => {
                let target = self.eval(target, location)?;
                let position = self.eval(index, location)?;
                match target {
                    Value::Array(mut items) => {
                        let slot = element_index(&position, items.len(), location)?;
                        Ok(items.swap_remove(slot))
                    }
                    other => Err(fatal(
                        format!("cannot index into {}", other.type_name()),
                        location,
                    )),
                }
            }
            Expr::Call {
                name,
                args,
                location: call_location,
            } => {
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg, call_location))
                    .collect::<InterpretResult<Vec<_>>>()?;
                self.call(name, args, call_location)
            }
            Expr::Unary(op, operand) => {
                let operand = self.eval(operand, location)?;
                value::unary(*op, operand).map_err(|m| fatal(m, location))
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.eval(lhs, location)?;
                let rhs = self.eval(rhs, location)?;
                value::binary(*op, lhs, rhs).map_err(|m| fatal(m, location))
            }
        }
    }

    fn call(&mut self, name: &str, args: Vec<Value>, location: &Location) -> InterpretResult<Value> {
        if let Some(result) = self.call_builtin(name, &args, location) {
            return result;
        }
        match self.devices.call(name, &args, self.mode) {
            Some(result) => result.map_err(|source| InterpretError::Device {
                source,
                location: location.clone(),
            }),
            None => Err(fatal(format!("unknown function '{name}'"), location)),
        }
    }
}

fn fatal(message: impl Into<String>, location: &Location) -> InterpretError {
    InterpretError::Fatal {
        message: message.into(),
        location: location.clone(),
    }
}

fn undefined(name: &str, location: &Location) -> InterpretError {
    fatal(format!("variable '{name}' used before it was assigned"), location)
}

fn element_index(position: &Value, len: usize, location: &Location) -> InterpretResult<usize> {
    match position {
        Value::Int(i) if *i >= 0 && (*i as u64) < len as u64 => Ok(*i as usize),
        Value::Int(i) => Err(fatal(
            format!("index {i} out of range for array of size {len}"),
            location,
        )),
        other => Err(fatal(
            format!("array index must be an integer, found {}", other.type_name()),
            location,
        )),
    }
}

/// Phase A: feed every token of the buffer to the grammar pass in check
/// mode.
///
/// Nothing is evaluated; syntax errors and calls to unknown functions are
/// reported even in branches no run would take.
pub fn syntax_check(program: &Program, devices: &DeviceSet) -> InterpretResult<()> {
    let tokens = program.tokens();
    let mut index = 0;
    while index < tokens.len() {
        let kind = tokens[index].kind;
        index = if kind.is_loop() || kind.is_conditional() {
            condition::check(tokens, index, devices)?;
            tokens[index].body_start.ok_or_else(|| {
                InterpretError::Corrupt(format!("header {index} ({kind}) is not linked"))
            })?
        } else if kind.is_control() {
            index + 1
        } else {
            let statement = parse_statement(tokens, index)?;
            statement
                .stmt
                .for_each_call(&mut |name, argc, location| {
                    builtins::check_call(devices, name, argc, location)
                })?;
            statement.next
        };
    }
    debug!(tokens = tokens.len(), "syntax check passed");
    Ok(())
}

/// Result of a successful test run.
#[derive(Debug, Clone, PartialEq)]
pub struct TestReport {
    /// How the run ended
    pub end: RunEnd,
    /// Severe diagnostics and warnings collected on the way
    pub diagnostics: Diagnostics,
    /// Everything the script printed or recorded
    pub emissions: Vec<Emission>,
    /// Simulated duration of the run
    pub simulated_time: Duration,
    /// Number of dispatched tokens
    pub dispatched: u64,
}

/// Phase B: execute the program once with simulated time and hardware.
///
/// Device test hooks run first; end-of-test hooks always run afterwards,
/// also when the script fails, and the program's loop state is reset so the
/// buffer is ready for the real run.
pub fn test_run(
    program: &mut Program,
    devices: &mut DeviceSet,
    pump: Option<&mut dyn EventPump>,
    yield_interval: u64,
) -> Result<TestReport> {
    info!("starting test run");
    if let Err(err) = devices.run_test_hooks() {
        if let Err(cleanup) = devices.run_end_of_test_hooks() {
            warn!(error = %cleanup, "end-of-test hooks failed after test hook failure");
        }
        return Err(err.into());
    }

    let mut emissions = Vec::new();
    let (result, diagnostics, simulated_time, dispatched) = {
        let mut ctx = InterpreterContext::new(program, devices, &mut emissions, RunMode::Test);
        if let Some(pump) = pump {
            ctx = ctx.with_pump(pump, yield_interval);
        }
        let result = ctx.run();
        (
            result,
            ctx.take_diagnostics(),
            ctx.elapsed(),
            ctx.dispatched(),
        )
    };

    let cleanup = devices.run_end_of_test_hooks();
    program.reset_run_state();

    for emission in &emissions {
        debug!(?emission, "test run output");
    }

    let end = match (result, cleanup) {
        (Ok(end), Ok(())) => end,
        (Err(err), cleanup) => {
            if let Err(cleanup) = cleanup {
                warn!(error = %cleanup, "end-of-test hooks failed");
            }
            return Err(err.into());
        }
        (Ok(_), Err(cleanup)) => return Err(cleanup.into()),
    };

    info!(?end, dispatched, ?simulated_time, "test run finished");
    Ok(TestReport {
        end,
        diagnostics,
        emissions,
        simulated_time,
        dispatched,
    })
}

/// Phase C: execute the program for real, honoring `quit` between
/// dispatches.
pub fn real_run(
    program: &mut Program,
    devices: &mut DeviceSet,
    sink: &mut dyn Sink,
    quit: QuitRequest,
) -> InterpretResult<(RunEnd, Diagnostics)> {
    let mut ctx = InterpreterContext::new(program, devices, sink, RunMode::Real).with_quit(quit);
    let end = ctx.run()?;
    Ok((end, ctx.take_diagnostics()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{Lexer, ValueStack, build, link};

    fn program(src: &str) -> Program {
        let mut lexer = Lexer::new("interp.edl", src);
        let mut stack = ValueStack::new();
        let mut program = build(&mut lexer, &mut stack).unwrap();
        link(&mut program).unwrap();
        program
    }

    fn run_test_mode(src: &str) -> (RunEnd, HashMap<String, Value>, Vec<Emission>) {
        let mut program = program(src);
        let mut devices = DeviceSet::new();
        let mut out = Vec::new();
        let mut ctx = InterpreterContext::new(&mut program, &mut devices, &mut out, RunMode::Test);
        let end = ctx.run().unwrap();
        let variables = ctx.variables.clone();
        (end, variables, out)
    }

    #[test]
    fn test_while_and_compound_assignment() {
        let (end, vars, _) = run_test_mode("i = 0; s = 0; while i < 5 { i += 1; s += i; }");
        assert_eq!(end, RunEnd::Completed);
        assert_eq!(vars["i"], Value::Int(5));
        assert_eq!(vars["s"], Value::Int(15));
    }

    #[test]
    fn test_until_and_unless() {
        let (_, vars, _) =
            run_test_mode("n = 0; until n >= 3 { n += 1; } unless n == 3 { n = 99; } else { n = -1; }");
        assert_eq!(vars["n"], Value::Int(-1));
    }

    #[test]
    fn test_else_if_chain_picks_one_branch() {
        let src = "x = 2; r = 0; if x == 1 { r = 1; } else if x == 2 { r = 2; } else { r = 3; } r += 10;";
        let (_, vars, _) = run_test_mode(src);
        assert_eq!(vars["r"], Value::Int(12));
    }

    #[test]
    fn test_next_and_break() {
        let src = "i = 0; odd = 0; forever { i += 1; if i > 9 { break; } if i % 2 == 0 { next; } odd += 1; }";
        let (_, vars, _) = run_test_mode(src);
        assert_eq!(vars["odd"], Value::Int(5));
        assert_eq!(vars["i"], Value::Int(10));
    }

    #[test]
    fn test_loop_reentry_recomputes_bounds() {
        let src = "total = 0; repeat 3 { repeat 2 { total += 1; } }";
        let (_, vars, _) = run_test_mode(src);
        assert_eq!(vars["total"], Value::Int(6));
    }

    #[test]
    fn test_break_resets_repeat_state() {
        let src = "n = 0; repeat 2 { repeat 5 { n += 1; if n % 3 == 0 { break; } } }";
        let (_, vars, _) = run_test_mode(src);
        // first pass breaks at 3, second pass breaks at 6
        assert_eq!(vars["n"], Value::Int(6));
    }

    #[test]
    fn test_float_truncation_warns() {
        let mut program = program("i = 1; i = 2.7;");
        let mut devices = DeviceSet::new();
        let mut out = Vec::new();
        let mut ctx = InterpreterContext::new(&mut program, &mut devices, &mut out, RunMode::Test);
        ctx.run().unwrap();
        assert_eq!(ctx.variable("i"), Some(&Value::Int(2)));
        assert_eq!(ctx.diagnostics().count(crate::diagnostics::Severity::Warning), 1);
    }

    #[test]
    fn test_array_elements() {
        let (_, vars, _) = run_test_mode("a = [1, 2, 3]; a[1] *= 10; b = a[1] + size(a);");
        assert_eq!(vars["b"], Value::Int(23));
        assert_eq!(
            vars["a"],
            Value::Array(vec![Value::Int(1), Value::Int(20), Value::Int(3)])
        );
    }

    #[test]
    fn test_runtime_errors_are_fatal() {
        for src in ["x = y + 1;", "x = 1 / 0;", "a = [1]; b = a[3];", "x = \"s\"; x = 1;"] {
            let mut program = program(src);
            let mut devices = DeviceSet::new();
            let mut out = Vec::new();
            let mut ctx =
                InterpreterContext::new(&mut program, &mut devices, &mut out, RunMode::Test);
            assert!(
                matches!(ctx.run(), Err(InterpretError::Fatal { .. })),
                "{src} should fail"
            );
        }
    }

    #[test]
    fn test_pump_stops_test_run() {
        let mut program = program("forever { x = 1; }");
        let mut devices = DeviceSet::new();
        let mut calls = 0;
        let mut pump = || {
            calls += 1;
            calls == 3
        };
        let report = test_run(&mut program, &mut devices, Some(&mut pump), 10).unwrap();
        assert_eq!(report.end, RunEnd::Stopped);
        assert_eq!(report.dispatched, 30);
        assert!(program.tokens().iter().all(|t| !t.entered));
    }

    #[test]
    fn test_real_run_jumps_to_on_stop_once() {
        let mut program = program("stage = 1; forever { wait(0.001); } ON_STOP: stage = 2;");
        let mut devices = DeviceSet::new();
        let mut out = Vec::new();
        let quit = QuitRequest::new();
        quit.request();
        let mut ctx = InterpreterContext::new(&mut program, &mut devices, &mut out, RunMode::Real)
            .with_quit(quit.clone());
        assert_eq!(ctx.run().unwrap(), RunEnd::Stopped);
        assert_eq!(ctx.variable("stage"), Some(&Value::Int(2)));
        assert!(!quit.is_listening());
    }

    #[test]
    fn test_real_run_without_on_stop_stops_immediately() {
        let mut program = program("x = 1; x = 2;");
        let mut devices = DeviceSet::new();
        let mut out = Vec::new();
        let quit = QuitRequest::new();
        quit.request();
        let (end, _) = real_run(&mut program, &mut devices, &mut out, quit).unwrap();
        assert_eq!(end, RunEnd::Stopped);
    }
}
