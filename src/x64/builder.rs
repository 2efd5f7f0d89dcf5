use std::collections::HashMap;
use std::fmt::Write as _;

use super::instruction::{Instruction, Opcode, Operand, Reg, SHADOW_SPACE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubroutineId(pub usize);

/// What a subroutine does once its body has run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ending {
    /// Control never falls off the end (the body already transferred it).
    Nothing,
    Return,
    Jump(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Inst(Instruction),
    /// Local label inside a body, e.g. `.cached`.
    Label(String),
}

#[derive(Debug, Clone)]
pub struct Subroutine {
    pub name: String,
    pub body: Vec<Line>,
    pub ending: Ending,
    pub parent: Option<SubroutineId>,
    pub children: Vec<SubroutineId>,
    /// Local bytes the prologue reserves on top of the shadow space.
    pub reserved: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Data,
    Bss,
}

#[derive(Debug, Clone)]
pub struct Assembly {
    externs: Vec<String>,
    globals: Vec<String>,
    data: Vec<String>,
    bss: Vec<String>,
    section: Section,
    subroutines: Vec<Subroutine>,
    by_name: HashMap<String, SubroutineId>,
    counter: usize,
}

impl Default for Assembly {
    fn default() -> Self {
        Self::new()
    }
}

impl Assembly {
    pub fn new() -> Self {
        Assembly {
            externs: Vec::new(),
            globals: Vec::new(),
            data: Vec::new(),
            bss: Vec::new(),
            section: Section::Data,
            subroutines: Vec::new(),
            by_name: HashMap::new(),
            counter: 0,
        }
    }

    /// Returns the subroutine called `name`, creating a root one on first reference.
    pub fn enter_subroutine(&mut self, name: &str) -> SubroutineId {
        if let Some(id) = self.by_name.get(name) {
            return *id;
        }
        self.create(name, None, Ending::Return)
    }

    fn create(&mut self, name: &str, parent: Option<SubroutineId>, ending: Ending) -> SubroutineId {
        let id = SubroutineId(self.subroutines.len());
        self.subroutines.push(Subroutine {
            name: name.to_string(),
            body: Vec::new(),
            ending,
            parent,
            children: Vec::new(),
            reserved: 0,
        });
        self.by_name.insert(name.to_string(), id);
        if let Some(parent) = parent {
            self.subroutines[parent.0].children.push(id);
        }
        id
    }

    /// Splits `parent` into a branch body and the code that follows it.
    ///
    /// The parent's ending moves to the `after` child, the parent itself ends
    /// with nothing (its body must branch explicitly), and the body child
    /// jumps to `after` when it falls through.
    pub fn split(
        &mut self,
        parent: SubroutineId,
        body_name: &str,
        after_name: &str,
    ) -> (SubroutineId, SubroutineId) {
        let inherited = std::mem::replace(&mut self.subroutines[parent.0].ending, Ending::Nothing);
        let body = self.create(body_name, Some(parent), Ending::Jump(after_name.to_string()));
        let after = self.create(after_name, Some(parent), inherited);
        (body, after)
    }

    pub fn find(&self, name: &str) -> Option<SubroutineId> {
        self.by_name.get(name).copied()
    }

    pub fn subroutine(&self, id: SubroutineId) -> &Subroutine {
        &self.subroutines[id.0]
    }

    pub fn subroutines(&self) -> &[Subroutine] {
        &self.subroutines
    }

    pub fn emit(&mut self, id: SubroutineId, inst: Instruction) {
        self.subroutines[id.0].body.push(Line::Inst(inst));
    }

    pub fn emit_label(&mut self, id: SubroutineId, label: &str) {
        self.subroutines[id.0].body.push(Line::Label(label.to_string()));
    }

    pub fn set_ending(&mut self, id: SubroutineId, ending: Ending) {
        self.subroutines[id.0].ending = ending;
    }

    pub fn reserve(&mut self, id: SubroutineId, bytes: u32) {
        let sub = &mut self.subroutines[id.0];
        sub.reserved = sub.reserved.max(bytes);
    }

    /// Frame-pointer teardown emitted before a `ret`.
    pub fn emit_epilogue(&mut self, id: SubroutineId) {
        for inst in epilogue() {
            self.emit(id, inst);
        }
    }

    pub fn declare_external(&mut self, name: &str) {
        if !self.externs.iter().any(|e| e == name) {
            self.externs.push(name.to_string());
        }
    }

    pub fn declare_global(&mut self, name: &str) {
        if !self.globals.iter().any(|g| g == name) {
            self.globals.push(name.to_string());
        }
    }

    pub fn externs(&self) -> &[String] {
        &self.externs
    }

    pub fn data(&self) -> &[String] {
        &self.data
    }

    pub fn bss(&self) -> &[String] {
        &self.bss
    }

    pub fn set_section(&mut self, section: Section) {
        self.section = section;
    }

    /// Appends a directive to whichever section is currently selected.
    pub fn write(&mut self, line: impl Into<String>) {
        match self.section {
            Section::Data => self.data.push(line.into()),
            Section::Bss => self.bss.push(line.into()),
        }
    }

    pub fn write_data(&mut self, line: impl Into<String>) {
        self.data.push(line.into());
    }

    pub fn write_bss(&mut self, line: impl Into<String>) {
        self.bss.push(line.into());
    }

    pub fn fresh(&mut self) -> usize {
        let n = self.counter;
        self.counter += 1;
        n
    }

    /// True for the structural tail of a split chain: no children, and every
    /// ancestor is reached as its parent's last child.
    fn is_chain_tail(&self, id: SubroutineId) -> bool {
        if !self.subroutines[id.0].children.is_empty() {
            return false;
        }
        let mut current = id;
        while let Some(parent) = self.subroutines[current.0].parent {
            if self.subroutines[parent.0].children.last() != Some(&current) {
                return false;
            }
            current = parent;
        }
        true
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        out.push_str("bits 64\n");
        for ext in &self.externs {
            let _ = writeln!(out, "extern {ext}");
        }
        out.push_str("\nsection .data\n");
        for line in &self.data {
            let _ = writeln!(out, "    {line}");
        }
        out.push_str("\nsection .bss\n");
        for line in &self.bss {
            let _ = writeln!(out, "    {line}");
        }
        out.push_str("\nsection .text\n");
        for global in &self.globals {
            let _ = writeln!(out, "global {global}");
        }

        for (idx, sub) in self.subroutines.iter().enumerate() {
            let _ = writeln!(out, "\n{}:", sub.name);
            if sub.parent.is_none() {
                for inst in prologue(align16(SHADOW_SPACE + sub.reserved)) {
                    let _ = writeln!(out, "    {inst}");
                }
            }
            for line in &sub.body {
                match line {
                    Line::Inst(inst) => {
                        let _ = writeln!(out, "    {inst}");
                    }
                    Line::Label(label) => {
                        let _ = writeln!(out, "{label}:");
                    }
                }
            }
            let tail = self.is_chain_tail(SubroutineId(idx));
            match &sub.ending {
                Ending::Nothing => {}
                Ending::Return => {
                    if tail {
                        for inst in epilogue() {
                            let _ = writeln!(out, "    {inst}");
                        }
                    }
                    let _ = writeln!(out, "    {}", Instruction::bare(Opcode::Ret));
                }
                Ending::Jump(target) => {
                    let _ = writeln!(
                        out,
                        "    {}",
                        Instruction::unary(Opcode::Jmp, Operand::Label(target.clone()))
                    );
                }
            }
        }
        out
    }
}

fn prologue(frame: u32) -> [Instruction; 3] {
    [
        Instruction::unary(Opcode::Push, Reg::Rbp),
        Instruction::binary(Opcode::Mov, Reg::Rbp, Reg::Rsp),
        Instruction::binary(Opcode::Sub, Reg::Rsp, i64::from(frame)),
    ]
}

fn epilogue() -> [Instruction; 2] {
    [
        Instruction::binary(Opcode::Mov, Reg::Rsp, Reg::Rbp),
        Instruction::unary(Opcode::Pop, Reg::Rbp),
    ]
}

pub fn align16(bytes: u32) -> u32 {
    (bytes + 15) & !15
}

#[cfg(test)]
mod tests {
    use super::*;
    use insta::assert_snapshot;

    #[test]
    fn split_moves_the_ending_to_the_after_child() {
        let mut asm = Assembly::new();
        let main = asm.enter_subroutine("main");
        let (body, after) = asm.split(main, "main.if0", "main.end0");
        assert_eq!(asm.subroutine(main).ending, Ending::Nothing);
        assert_eq!(asm.subroutine(body).ending, Ending::Jump("main.end0".into()));
        assert_eq!(asm.subroutine(after).ending, Ending::Return);
        assert_eq!(asm.subroutine(main).children, vec![body, after]);
        assert!(asm.is_chain_tail(after));
        assert!(!asm.is_chain_tail(body));
        assert!(!asm.is_chain_tail(main));
    }

    #[test]
    fn nested_split_tail_follows_last_children() {
        let mut asm = Assembly::new();
        let main = asm.enter_subroutine("main");
        let (body, _after) = asm.split(main, "main.if0", "main.end0");
        let (_, inner_after) = asm.split(body, "main.if1", "main.end1");
        // The inner tail still jumps out to the outer after block.
        assert_eq!(
            asm.subroutine(inner_after).ending,
            Ending::Jump("main.end0".into())
        );
        assert!(!asm.is_chain_tail(inner_after));
    }

    #[test]
    fn enter_subroutine_reuses_existing() {
        let mut asm = Assembly::new();
        let a = asm.enter_subroutine("f");
        let b = asm.enter_subroutine("f");
        assert_eq!(a, b);
        assert_eq!(asm.subroutines().len(), 1);
    }

    #[test]
    fn externs_are_deduplicated() {
        let mut asm = Assembly::new();
        asm.declare_external("HeapAlloc");
        asm.declare_external("HeapAlloc");
        assert_eq!(asm.externs(), &["HeapAlloc".to_string()]);
    }

    #[test]
    fn section_mode_routes_writes() {
        let mut asm = Assembly::new();
        asm.write("x dd 1");
        asm.set_section(Section::Bss);
        asm.write("y resq 1");
        assert_eq!(asm.data(), &["x dd 1".to_string()]);
        assert_eq!(asm.bss(), &["y resq 1".to_string()]);
    }

    #[test]
    fn serializes_frame_and_branches() {
        let mut asm = Assembly::new();
        asm.declare_global("main");
        asm.write_data("x dd 5");
        let main = asm.enter_subroutine("main");
        asm.reserve(main, 8);
        asm.emit(main, Instruction::binary(Opcode::Mov, Reg::Rax, 1));
        asm.emit(main, Instruction::unary(Opcode::Jmp, Operand::Label("main.if0".into())));
        let (body, after) = asm.split(main, "main.if0", "main.end0");
        asm.emit(body, Instruction::binary(Opcode::Mov, Reg::Rax, 2));
        asm.emit(after, Instruction::binary(Opcode::Mov, Reg::Rax, 3));
        assert_snapshot!(asm.serialize(), @r"
        bits 64

        section .data
            x dd 5

        section .bss

        section .text
        global main

        main:
            push rbp
            mov rbp, rsp
            sub rsp, 48
            mov rax, 1
            jmp main.if0

        main.if0:
            mov rax, 2
            jmp main.end0

        main.end0:
            mov rax, 3
            mov rsp, rbp
            pop rbp
            ret
        ");
    }

    #[test]
    fn frame_is_aligned() {
        assert_eq!(align16(32), 32);
        assert_eq!(align16(33), 48);
        assert_eq!(align16(40), 48);
    }
}
