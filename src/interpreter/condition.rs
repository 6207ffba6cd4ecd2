//! Condition evaluator for loop and conditional headers.
//!
//! The condition of a header is the token range between the header and the
//! `{` that opens its block. `while`, `until`, `if` and `unless` take a
//! single numeric expression; `repeat` takes an integer count; `for` takes
//! `var = start : end [: step]`; `forever` takes nothing.

use super::grammar::{Expr, parse_expression};
use super::value::Value;
use super::{InterpreterContext, builtins, fatal};
use crate::device::DeviceSet;
use crate::error::{InterpretError, InterpretResult};
use crate::program::{Location, LoopCounter, Number, ProgToken, TokenKind};

/// Parsed `for` header.
#[derive(Debug, Clone, PartialEq)]
pub struct ForHeader {
    /// Loop variable
    pub variable: String,
    /// Start expression
    pub start: Expr,
    /// Inclusive end expression
    pub end: Expr,
    /// Increment expression (defaults to 1)
    pub step: Option<Expr>,
}

/// Token range `[start, end)` holding the condition of `header`.
fn condition_span(tokens: &[ProgToken], header: usize) -> InterpretResult<(usize, usize)> {
    let body = tokens
        .get(header)
        .and_then(|t| t.body_start)
        .filter(|&body| body > header)
        .ok_or_else(|| InterpretError::Corrupt(format!("header {header} is not linked")))?;
    Ok((header + 1, body - 1))
}

fn syntax(message: impl Into<String>, location: &Location) -> InterpretError {
    InterpretError::Syntax {
        message: message.into(),
        location: location.clone(),
    }
}

/// Split a `for` header into its parts.
pub fn parse_for(tokens: &[ProgToken], header: usize) -> InterpretResult<ForHeader> {
    let (start, end) = condition_span(tokens, header)?;
    let location = &tokens[header].location;

    let variable = match tokens.get(start) {
        Some(token) if start < end && token.kind == TokenKind::Variable => token
            .payload
            .name()
            .map(str::to_string)
            .ok_or_else(|| InterpretError::Corrupt("variable token without name".into()))?,
        _ => return Err(syntax("for loop must start with a variable", location)),
    };
    if start + 1 >= end || tokens[start + 1].kind != TokenKind::Assign {
        return Err(syntax("expected '=' after for loop variable", location));
    }

    // Colons nested in calls or indexes belong to those.
    let mut parts = Vec::new();
    let mut part_start = start + 2;
    let mut depth = 0usize;
    for index in part_start..end {
        match tokens[index].kind {
            TokenKind::LParen | TokenKind::LBracket => depth += 1,
            TokenKind::RParen | TokenKind::RBracket => depth = depth.saturating_sub(1),
            TokenKind::Colon if depth == 0 => {
                parts.push(parse_expression(tokens, part_start, index)?);
                part_start = index + 1;
            }
            _ => {}
        }
    }
    parts.push(parse_expression(tokens, part_start, end)?);

    let mut parts = parts.into_iter();
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(start), Some(end), step, None) => Ok(ForHeader {
            variable,
            start,
            end,
            step,
        }),
        _ => Err(syntax(
            "for loop needs 'start : end' or 'start : end : step'",
            location,
        )),
    }
}

/// Syntax-only check of the condition of `header` (no evaluation).
pub fn check(tokens: &[ProgToken], header: usize, devices: &DeviceSet) -> InterpretResult<()> {
    let kind = tokens[header].kind;
    let (start, end) = condition_span(tokens, header)?;
    let location = &tokens[header].location;
    let mut check_calls =
        |name: &str, argc: usize, at: &Location| builtins::check_call(devices, name, argc, at);

    match kind {
        TokenKind::Forever if start == end => Ok(()),
        TokenKind::Forever => Err(syntax("forever takes no condition", location)),
        TokenKind::For => {
            let header = parse_for(tokens, header)?;
            header.start.for_each_call(&mut check_calls)?;
            header.end.for_each_call(&mut check_calls)?;
            match &header.step {
                Some(step) => step.for_each_call(&mut check_calls),
                None => Ok(()),
            }
        }
        _ => parse_expression(tokens, start, end)?.for_each_call(&mut check_calls),
    }
}

impl InterpreterContext<'_> {
    fn header_expression(&self, header: usize) -> InterpretResult<(Expr, Location)> {
        let tokens = self.program.tokens();
        let (start, end) = condition_span(tokens, header)?;
        let expr = parse_expression(tokens, start, end)?;
        Ok((expr, tokens[header].location.clone()))
    }

    /// Truth value of the condition of a `while`/`until`/`if`/`unless`
    /// header.
    pub(crate) fn test_condition(&mut self, header: usize) -> InterpretResult<bool> {
        let (expr, location) = self.header_expression(header)?;
        let value = self.eval(&expr, &location)?;
        value.truth().ok_or_else(|| {
            fatal(
                format!("condition must be numeric, found {}", value.type_name()),
                &location,
            )
        })
    }

    /// Number of iterations requested by a `repeat` header.
    ///
    /// A negative count is reported as severe and runs the body zero times.
    pub(crate) fn repeat_count(&mut self, header: usize) -> InterpretResult<i64> {
        let (expr, location) = self.header_expression(header)?;
        match self.eval(&expr, &location)? {
            Value::Int(count) if count < 0 => {
                self.diagnostics
                    .severe(format!("negative repeat count {count}"), &location);
                Ok(0)
            }
            Value::Int(count) => Ok(count),
            other => Err(fatal(
                format!("repeat count must be an integer, found {}", other.type_name()),
                &location,
            )),
        }
    }

    /// Evaluate the bounds of a `for` header and bind its variable to the
    /// start value.
    pub(crate) fn enter_for(&mut self, header: usize) -> InterpretResult<LoopCounter> {
        let parsed = parse_for(self.program.tokens(), header)?;
        let location = self.location(header);

        let bound = |ctx: &mut Self, expr: &Expr, what: &str| -> InterpretResult<Number> {
            let value = ctx.eval(expr, &location)?;
            value.as_number().ok_or_else(|| {
                fatal(
                    format!("for loop {what} must be numeric, found {}", value.type_name()),
                    &location,
                )
            })
        };
        let start = bound(self, &parsed.start, "start")?;
        let end = bound(self, &parsed.end, "end")?;
        let step = match &parsed.step {
            Some(step) => bound(self, step, "increment")?,
            None => Number::Int(1),
        };

        let integer = match self.variables.get(&parsed.variable) {
            Some(Value::Int(_)) => true,
            Some(Value::Float(_)) => false,
            Some(other) => {
                return Err(fatal(
                    format!(
                        "for loop variable '{}' is a {}",
                        parsed.variable,
                        other.type_name()
                    ),
                    &location,
                ));
            }
            None => matches!(start, Number::Int(_)),
        };

        let (start, end, step) = if integer {
            match (start, end, step) {
                (Number::Int(_), Number::Int(_), Number::Int(_)) => (start, end, step),
                (_, _, Number::Float(_)) => {
                    return Err(fatal(
                        format!(
                            "float increment for integer loop variable '{}'",
                            parsed.variable
                        ),
                        &location,
                    ));
                }
                _ => {
                    return Err(fatal(
                        format!(
                            "start and end of integer loop variable '{}' must be integers",
                            parsed.variable
                        ),
                        &location,
                    ));
                }
            }
        } else {
            (
                Number::Float(start.as_f64()),
                Number::Float(end.as_f64()),
                Number::Float(step.as_f64()),
            )
        };

        if step.as_f64() == 0.0 {
            return Err(fatal("for loop increment is zero", &location));
        }

        self.variables
            .insert(parsed.variable.clone(), Value::from(start));
        Ok(LoopCounter::For {
            variable: parsed.variable,
            end,
            step,
        })
    }

    fn for_state(&self, header: usize) -> InterpretResult<(String, Number, Number)> {
        match &self.program.tokens()[header].counter {
            LoopCounter::For {
                variable,
                end,
                step,
            } => Ok((variable.clone(), *end, *step)),
            _ => Err(InterpretError::Corrupt(format!(
                "for header {header} lost its bounds"
            ))),
        }
    }

    fn loop_variable(&self, variable: &str, location: &Location) -> InterpretResult<Number> {
        self.variables
            .get(variable)
            .and_then(Value::as_number)
            .ok_or_else(|| {
                fatal(
                    format!("for loop variable '{variable}' is no longer a number"),
                    location,
                )
            })
    }

    /// Add the increment to the loop variable of a `for` header.
    pub(crate) fn advance_for(&mut self, header: usize, location: &Location) -> InterpretResult<()> {
        let (variable, _, step) = self.for_state(header)?;
        let next = match (self.loop_variable(&variable, location)?, step) {
            (Number::Int(v), Number::Int(s)) => Value::Int(v.checked_add(s).ok_or_else(|| {
                fatal(format!("for loop variable '{variable}' overflowed"), location)
            })?),
            (v, s) => Value::Float(v.as_f64() + s.as_f64()),
        };
        self.variables.insert(variable, next);
        Ok(())
    }

    /// Whether the loop variable of a `for` header is still within bounds.
    pub(crate) fn for_continues(&self, header: usize, location: &Location) -> InterpretResult<bool> {
        let (variable, end, step) = self.for_state(header)?;
        let current = self.loop_variable(&variable, location)?;
        let ascending = step.as_f64() > 0.0;
        Ok(match (current, end) {
            (Number::Int(v), Number::Int(e)) if ascending => v <= e,
            (Number::Int(v), Number::Int(e)) => v >= e,
            (v, e) if ascending => v.as_f64() <= e.as_f64(),
            (v, e) => v.as_f64() >= e.as_f64(),
        })
    }
}
