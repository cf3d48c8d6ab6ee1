//! Protected regions and the per-frame exception dispatcher.
//!
//! Dispatch is single pass: clauses are scanned in declaration order (inner
//! regions first) from the throw offset. A matching `catch` or accepting
//! `filter` takes the exception; a covering `finally` or `fault` runs first
//! and the scan resumes after it once its `endfinally` executes. Fatal
//! unwinds only run `finally` and `fault` handlers.
use crate::{
    types::TypeHandle,
    utils::DebugStr,
    value::{ObjectRef, StackValue},
    vm::{
        error::{ExecResult, ManagedExceptionKind, Unwind, VerificationError},
        frame::Frame,
        host::{ResolvedToken, TokenKind},
        interpreter::Interpreter,
        opcodes::Token,
    },
};
use std::{
    fmt::{self, Debug, Formatter},
    ops::Range,
};

/// Specifies when a handler runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClauseKind {
    /// Runs when the exception is assignable to the token's type.
    Catch(Token),
    /// Runs when the filter block at `filter_offset` pushes a non-zero value.
    Filter { filter_offset: u32 },
    /// Runs whenever control leaves the protected block.
    Finally,
    /// Runs only when the protected block is left by an exception.
    Fault,
}

/// One entry of a method's protected-region table.
#[derive(Clone, PartialEq, Eq)]
pub struct ExceptionClause {
    pub kind: ClauseKind,
    pub try_range: Range<u32>,
    pub handler_range: Range<u32>,
}

impl Debug for ExceptionClause {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entry(&DebugStr(format!(
                "try {{ IL_{:04x}..IL_{:04x} }}",
                self.try_range.start, self.try_range.end
            )))
            .entry(&DebugStr(format!(
                "{:?} {{ IL_{:04x}..IL_{:04x} }}",
                self.kind, self.handler_range.start, self.handler_range.end
            )))
            .finish()
    }
}

impl ExceptionClause {
    pub fn new(kind: ClauseKind, try_range: Range<u32>, handler_range: Range<u32>) -> Self {
        Self {
            kind,
            try_range,
            handler_range,
        }
    }

    pub fn covers(&self, offset: u32) -> bool {
        self.try_range.contains(&offset)
    }

    /// Whether `offset` is inside the handler, or inside the filter block
    /// for filter clauses.
    pub fn in_handler(&self, offset: u32) -> bool {
        self.handler_range.contains(&offset) || self.in_filter(offset)
    }

    pub fn in_filter(&self, offset: u32) -> bool {
        match self.kind {
            ClauseKind::Filter { filter_offset } => {
                (filter_offset..self.handler_range.start).contains(&offset)
            }
            _ => false,
        }
    }

    fn is_finally(&self) -> bool {
        matches!(self.kind, ClauseKind::Finally)
    }
}

/// What happens when the handler currently executing completes.
#[derive(Clone, Debug, PartialEq)]
pub enum Continuation {
    /// A catch (or accepted filter) handler is running; `rethrow` raises
    /// `exception` again.
    Catch { clause: usize, exception: ObjectRef },
    /// A finally entered by `leave`; the jump to `target` resumes after it.
    Leave { clause: usize, from: u32, target: u32 },
    /// A finally or fault entered while unwinding; dispatch resumes after it.
    Unwind {
        clause: usize,
        unwind: Unwind,
        throw_offset: u32,
    },
}

impl Continuation {
    fn clause(&self) -> usize {
        match self {
            Continuation::Catch { clause, .. }
            | Continuation::Leave { clause, .. }
            | Continuation::Unwind { clause, .. } => *clause,
        }
    }
}

/// A filter block being evaluated.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterState {
    pub clause: usize,
    pub exception: ObjectRef,
    pub throw_offset: u32,
}

#[derive(Debug, Default)]
pub struct ExceptionState {
    pub continuations: Vec<Continuation>,
    pub filter: Option<FilterState>,
}

impl ExceptionState {
    /// Exception object slots referenced by this state, for root scanning.
    pub(crate) fn exception_slots(&mut self) -> Vec<*mut usize> {
        let mut slots = vec![];
        for c in &mut self.continuations {
            match c {
                Continuation::Catch { exception, .. } => slots.push(&mut exception.0 as *mut usize),
                Continuation::Unwind {
                    unwind: Unwind::Exception(exception),
                    ..
                } => slots.push(&mut exception.0 as *mut usize),
                _ => {}
            }
        }
        if let Some(filter) = &mut self.filter {
            slots.push(&mut filter.exception.0 as *mut usize);
        }
        slots
    }
}

impl Interpreter {
    /// Routes an unwind raised at `throw_offset` to a handler in `frame`,
    /// scanning clauses from `start`. `Ok` means execution continues in the
    /// frame; `Err` carries the unwind to the caller.
    pub(crate) fn dispatch_exception(
        &self,
        frame: &mut Frame,
        unwind: Unwind,
        throw_offset: u32,
        start: usize,
    ) -> ExecResult<()> {
        let method = frame.method.clone();
        let clauses = &method.definition.clauses;

        // An exception escaping a filter block counts as the filter declining.
        if let Some(filter) = frame.exceptions.filter.take() {
            if clauses[filter.clause].in_filter(throw_offset) {
                vm_trace!(self, "exception in filter of clause {}; declined", filter.clause);
                let resumed = match unwind {
                    Unwind::Exception(_) => Unwind::Exception(filter.exception),
                    fatal => fatal,
                };
                return self.dispatch_exception(frame, resumed, filter.throw_offset, filter.clause + 1);
            }
            frame.exceptions.filter = Some(filter);
        }

        for (index, clause) in clauses.iter().enumerate().skip(start) {
            if clause.in_handler(throw_offset) {
                // Escaping a handler abandons whatever it was going to do next.
                frame.exceptions.continuations.retain(|c| c.clause() != index);
                continue;
            }
            if !clause.covers(throw_offset) {
                continue;
            }
            match (clause.kind, &unwind) {
                (ClauseKind::Catch(token), Unwind::Exception(exception)) => {
                    if let Some(caught) = self.catch_matches(frame, token, *exception)? {
                        self.enter_catch(frame, index, caught);
                        return Ok(());
                    }
                }
                (ClauseKind::Filter { filter_offset }, Unwind::Exception(exception)) => {
                    frame.exceptions.filter = Some(FilterState {
                        clause: index,
                        exception: *exception,
                        throw_offset,
                    });
                    self.enter_handler(frame, filter_offset, Some(*exception));
                    return Ok(());
                }
                (ClauseKind::Finally | ClauseKind::Fault, _) => {
                    vm_trace!(self, "running {:?} handler of clause {}", clause.kind, index);
                    frame.exceptions.continuations.push(Continuation::Unwind {
                        clause: index,
                        unwind,
                        throw_offset,
                    });
                    self.enter_handler(frame, clause.handler_range.start, None);
                    return Ok(());
                }
                _ => {}
            }
        }
        Err(unwind)
    }

    /// The object a catch clause receives, if it takes `exception`: the
    /// exception itself, or the object inside a foreign-exception wrapper.
    fn catch_matches(
        &self,
        frame: &Frame,
        token: Token,
        exception: ObjectRef,
    ) -> ExecResult<Option<ObjectRef>> {
        let ResolvedToken::Type(catch_type) =
            self.host.resolve_token(&frame.scope(), token, TokenKind::Type)?
        else {
            return Err(VerificationError::UnexpectedOperand {
                instruction: "catch",
                actual: crate::types::ValueTypeDescriptor::OBJECT,
            }
            .into());
        };
        if self.is_instance(exception, catch_type) {
            return Ok(Some(exception));
        }
        Ok(self
            .host
            .unwrap_exception(exception)
            .filter(|inner| self.is_instance(*inner, catch_type)))
    }

    fn is_instance(&self, obj: ObjectRef, ty: TypeHandle) -> bool {
        !obj.is_null() && self.host.is_assignable(self.host.object_type(obj), ty)
    }

    fn enter_catch(&self, frame: &mut Frame, clause: usize, exception: ObjectRef) {
        let start = frame.method.definition.clauses[clause].handler_range.start;
        vm_trace!(self, "caught {:?} in clause {} at IL_{:04x}", exception, clause, start);
        self.metrics.record_exception_caught();
        frame.exceptions.continuations.push(Continuation::Catch { clause, exception });
        self.enter_handler(frame, start, Some(exception));
    }

    /// Jumps to a handler or filter with the stack holding only `exception`.
    fn enter_handler(&self, frame: &mut Frame, offset: u32, exception: Option<ObjectRef>) {
        frame.stack.clear();
        frame.staging.clear();
        if let Some(exception) = exception {
            // A cleared stack always has room for one entry.
            let _ = frame.stack.push(StackValue::ObjectRef(exception));
        }
        frame.ip = offset as usize;
    }

    pub(crate) fn throw(&self, frame: &mut Frame) -> ExecResult<()> {
        let exception = frame.stack.pop_value()?;
        match exception {
            StackValue::ObjectRef(o) if o.is_null() => {
                Err(self.exception(ManagedExceptionKind::NullReference))
            }
            StackValue::ObjectRef(o) => {
                self.metrics.record_exception_thrown();
                Err(Unwind::Exception(o))
            }
            other => Err(VerificationError::UnexpectedOperand {
                instruction: "throw",
                actual: crate::types::ValueTypeDescriptor::Primitive(other.kind()),
            }
            .into()),
        }
    }

    /// `rethrow` at offset `at`, which must be inside a catch handler.
    pub(crate) fn rethrow(&self, frame: &mut Frame, at: u32) -> ExecResult<()> {
        let clauses = &frame.method.definition.clauses;
        let exception = frame
            .exceptions
            .continuations
            .iter()
            .rev()
            .find_map(|c| match c {
                Continuation::Catch { clause, exception } if clauses[*clause].handler_range.contains(&at) => {
                    Some(*exception)
                }
                _ => None,
            })
            .ok_or(VerificationError::MisplacedInstruction("rethrow"))?;
        self.metrics.record_exception_thrown();
        Err(Unwind::Exception(exception))
    }

    /// `leave`: exits catch handlers being left, then runs each covering
    /// finally innermost first before jumping to `target`.
    pub(crate) fn leave(&self, frame: &mut Frame, from: u32, target: u32) -> ExecResult<()> {
        if target as usize > frame.method.code().len() {
            return Err(VerificationError::BranchOutOfRange(target as i64).into());
        }
        frame.stack.clear();
        let method = frame.method.clone();
        let clauses = &method.definition.clauses;
        while let Some(Continuation::Catch { clause, .. }) = frame.exceptions.continuations.last() {
            let handler = &clauses[*clause].handler_range;
            if handler.contains(&from) && !handler.contains(&target) {
                frame.exceptions.continuations.pop();
            } else {
                break;
            }
        }
        self.continue_leave(frame, from, target, 0);
        Ok(())
    }

    fn continue_leave(&self, frame: &mut Frame, from: u32, target: u32, start: usize) {
        let method = frame.method.clone();
        let next = method
            .definition
            .clauses
            .iter()
            .enumerate()
            .skip(start)
            .find(|(_, c)| c.is_finally() && c.covers(from) && !c.covers(target));
        match next {
            Some((clause, c)) => {
                vm_trace!(self, "leave IL_{:04x}: running finally of clause {}", target, clause);
                frame
                    .exceptions
                    .continuations
                    .push(Continuation::Leave { clause, from, target });
                frame.stack.clear();
                frame.ip = c.handler_range.start as usize;
            }
            None => frame.ip = target as usize,
        }
    }

    pub(crate) fn end_finally(&self, frame: &mut Frame) -> ExecResult<()> {
        match frame.exceptions.continuations.pop() {
            Some(Continuation::Leave { clause, from, target }) => {
                self.continue_leave(frame, from, target, clause + 1);
                Ok(())
            }
            Some(Continuation::Unwind {
                clause,
                unwind,
                throw_offset,
            }) => self.dispatch_exception(frame, unwind, throw_offset, clause + 1),
            Some(c @ Continuation::Catch { .. }) => {
                frame.exceptions.continuations.push(c);
                Err(VerificationError::MisplacedInstruction("endfinally").into())
            }
            None => Err(VerificationError::MisplacedInstruction("endfinally").into()),
        }
    }

    pub(crate) fn end_filter(&self, frame: &mut Frame) -> ExecResult<()> {
        let verdict = frame.stack.pop_value()?;
        let filter = frame
            .exceptions
            .filter
            .take()
            .ok_or(VerificationError::MisplacedInstruction("endfilter"))?;
        if verdict.is_zero() {
            vm_trace!(self, "filter of clause {} declined", filter.clause);
            self.dispatch_exception(
                frame,
                Unwind::Exception(filter.exception),
                filter.throw_offset,
                filter.clause + 1,
            )
        } else {
            self.enter_catch(frame, filter.clause, filter.exception);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_block_is_part_of_the_handler() {
        let clause = ExceptionClause::new(ClauseKind::Filter { filter_offset: 10 }, 0..10, 20..30);
        assert!(clause.in_filter(15));
        assert!(clause.in_handler(15));
        assert!(clause.in_handler(25));
        assert!(!clause.in_handler(30));
        assert!(clause.covers(0));
        assert!(!clause.covers(10));
    }
}
