//! A small IL assembler with forward labels and protected regions.
use crate::vm::{
    exceptions::{ClauseKind, ExceptionClause},
    opcodes::{self, BranchKind, Opcode, Token},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Label(usize);

/// A 32-bit relative target to patch once labels are placed.
#[derive(Debug)]
struct Fixup {
    at: usize,
    /// Offset the displacement is relative to.
    base: usize,
    label: Label,
}

#[derive(Debug)]
enum PendingKind {
    Catch(Token),
    Filter(Label),
    Finally,
    Fault,
}

#[derive(Debug)]
struct PendingClause {
    kind: PendingKind,
    try_range: (Label, Label),
    handler_range: (Label, Label),
}

#[derive(Debug, Default)]
pub struct ILBuilder {
    code: Vec<u8>,
    labels: Vec<Option<u32>>,
    fixups: Vec<Fixup>,
    clauses: Vec<PendingClause>,
}

impl ILBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Places `label` at the current offset.
    pub fn mark(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.here());
        self
    }

    pub fn here(&self) -> u32 {
        self.code.len() as u32
    }

    /// Appends a label-free instruction. Branches, `leave` and `switch` go
    /// through their own methods.
    pub fn emit(&mut self, op: Opcode) -> &mut Self {
        opcodes::encode(op, &mut self.code);
        self
    }

    fn relative(&mut self, label: Label) {
        let at = self.code.len() - 4;
        self.fixups.push(Fixup {
            at,
            base: self.code.len(),
            label,
        });
    }

    pub fn branch(&mut self, kind: BranchKind, label: Label) -> &mut Self {
        let here = self.here();
        opcodes::encode(Opcode::Branch(kind, here), &mut self.code);
        self.relative(label);
        self
    }

    pub fn leave(&mut self, label: Label) -> &mut Self {
        let here = self.here();
        opcodes::encode(Opcode::Leave(here), &mut self.code);
        self.relative(label);
        self
    }

    pub fn switch(&mut self, targets: &[Label]) -> &mut Self {
        self.code.push(0x45);
        self.code.extend_from_slice(&(targets.len() as u32).to_le_bytes());
        let table = self.code.len();
        self.code.resize(table + targets.len() * 4, 0);
        let base = self.code.len();
        for (i, label) in targets.iter().enumerate() {
            self.fixups.push(Fixup {
                at: table + i * 4,
                base,
                label: *label,
            });
        }
        self
    }

    fn clause(&mut self, kind: PendingKind, try_range: (Label, Label), handler_range: (Label, Label)) -> &mut Self {
        self.clauses.push(PendingClause {
            kind,
            try_range,
            handler_range,
        });
        self
    }

    /// Clauses must be added innermost first.
    pub fn catch(&mut self, catch_type: Token, try_range: (Label, Label), handler: (Label, Label)) -> &mut Self {
        self.clause(PendingKind::Catch(catch_type), try_range, handler)
    }

    /// `filter` labels the filter block, which must end right where the
    /// handler starts.
    pub fn filter(&mut self, filter: Label, try_range: (Label, Label), handler: (Label, Label)) -> &mut Self {
        self.clause(PendingKind::Filter(filter), try_range, handler)
    }

    pub fn finally(&mut self, try_range: (Label, Label), handler: (Label, Label)) -> &mut Self {
        self.clause(PendingKind::Finally, try_range, handler)
    }

    pub fn fault(&mut self, try_range: (Label, Label), handler: (Label, Label)) -> &mut Self {
        self.clause(PendingKind::Fault, try_range, handler)
    }

    /// Resolves labels and returns the body and its clause table.
    ///
    /// # Panics
    /// If a referenced label was never marked.
    pub fn finish(&mut self) -> (Vec<u8>, Vec<ExceptionClause>) {
        let labels = std::mem::take(&mut self.labels);
        let resolve = |label: Label| -> u32 {
            match labels[label.0] {
                Some(offset) => offset,
                None => panic!("IL label {} used but never marked", label.0),
            }
        };
        let mut code = std::mem::take(&mut self.code);
        for fixup in self.fixups.drain(..) {
            let target = resolve(fixup.label) as i64;
            let delta = (target - fixup.base as i64) as i32;
            code[fixup.at..fixup.at + 4].copy_from_slice(&delta.to_le_bytes());
        }
        let clauses = self
            .clauses
            .drain(..)
            .map(|c| {
                let kind = match c.kind {
                    PendingKind::Catch(token) => ClauseKind::Catch(token),
                    PendingKind::Filter(label) => ClauseKind::Filter {
                        filter_offset: resolve(label),
                    },
                    PendingKind::Finally => ClauseKind::Finally,
                    PendingKind::Fault => ClauseKind::Fault,
                };
                ExceptionClause::new(
                    kind,
                    resolve(c.try_range.0)..resolve(c.try_range.1),
                    resolve(c.handler_range.0)..resolve(c.handler_range.1),
                )
            })
            .collect();
        (code, clauses)
    }
}
