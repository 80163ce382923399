use crate::{Element, Instruction, Opcode, Program, VmError, VmString};
use std::io::Write;
use tracing::{debug, trace};

pub const STACK_CAPACITY: usize = 1000;
pub const CALL_STACK_CAPACITY: usize = 1000;
pub const LOCALS_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    pub stack_capacity: usize,
    pub call_stack_capacity: usize,
    pub locals_capacity: usize,
    pub trace: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            stack_capacity: STACK_CAPACITY,
            call_stack_capacity: CALL_STACK_CAPACITY,
            locals_capacity: LOCALS_CAPACITY,
            trace: false,
        }
    }
}

impl VmConfig {
    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_stack_capacity(mut self, capacity: usize) -> Self {
        self.stack_capacity = capacity;
        self
    }

    pub fn with_call_stack_capacity(mut self, capacity: usize) -> Self {
        self.call_stack_capacity = capacity;
        self
    }

    pub fn with_locals_capacity(mut self, capacity: usize) -> Self {
        self.locals_capacity = capacity;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Where RET resumes; `None` for the outermost `main` frame.
    pub return_address: Option<usize>,
    pub name: String,
    pub nargs: usize,
    pub nlocals: usize,
    pub locals: Vec<Element>,
}

impl Frame {
    pub fn new(
        name: impl Into<String>,
        return_address: Option<usize>,
        capacity: usize,
    ) -> Self {
        Self {
            return_address,
            name: name.into(),
            nargs: 0,
            nlocals: 0,
            locals: vec![Element::Empty; capacity],
        }
    }

    pub fn declared(&self) -> usize {
        self.nargs + self.nlocals
    }

    pub fn declared_locals(&self) -> &[Element] {
        &self.locals[..self.declared()]
    }
}

pub struct VirtualMachine {
    program: Program,
    config: VmConfig,
    ip: usize,
    stack: Vec<Element>,
    frames: Vec<Frame>,
    output: Vec<u8>,
    trace: Vec<u8>,
    started: bool,
    halted: bool,
    // Instruction being executed, for error reports.
    address: usize,
    opcode: Opcode,
}

impl VirtualMachine {
    pub fn new(program: Program) -> Self {
        Self::with_config(program, VmConfig::default())
    }

    pub fn with_config(program: Program, config: VmConfig) -> Self {
        Self {
            program,
            config,
            ip: 0,
            stack: Vec::with_capacity(config.stack_capacity),
            frames: Vec::new(),
            output: Vec::new(),
            trace: Vec::new(),
            started: false,
            halted: false,
            address: 0,
            opcode: Opcode::Halt,
        }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Everything PRINT has written so far, as raw bytes.
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn trace(&self) -> &[u8] {
        &self.trace
    }

    pub fn stack(&self) -> &[Element] {
        &self.stack
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn ip(&self) -> usize {
        self.ip
    }

    pub fn stack_pointer(&self) -> isize {
        self.stack.len() as isize - 1
    }

    pub fn call_stack_pointer(&self) -> isize {
        self.frames.len() as isize - 1
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn run(&mut self) -> Result<(), VmError> {
        while !self.step()? {}
        Ok(())
    }

    /// Executes one instruction, entering `main` first. Returns `true` once
    /// the machine has halted.
    pub fn step(&mut self) -> Result<bool, VmError> {
        if !self.started {
            self.start()?;
        }
        if self.halted {
            return Ok(true);
        }
        if self.ip >= self.program.len()
            || self.program.code[self.ip] == Opcode::Halt as u8
        {
            self.halt();
            return Ok(true);
        }

        let address = self.ip;
        let instruction = Instruction::decode(&self.program.code, address)?;
        trace!(ip = address, opcode = %instruction.opcode(), "dispatch");
        if self.config.trace {
            self.trace_instruction(address, &instruction);
        }

        self.address = address;
        self.opcode = instruction.opcode();
        self.ip = address + instruction.size();
        self.execute(&instruction)?;

        if self.config.trace {
            self.trace_state();
        }
        Ok(false)
    }

    fn start(&mut self) -> Result<(), VmError> {
        let main = self
            .program
            .functions
            .lookup("main")
            .ok_or(VmError::MainNotFound)?;
        self.frames
            .push(Frame::new("main", None, self.config.locals_capacity));
        self.ip = main as usize;
        self.started = true;
        debug!(
            address = main,
            code_bytes = self.program.len(),
            strings = self.program.strings.len(),
            "entering main"
        );
        Ok(())
    }

    fn halt(&mut self) {
        if self.config.trace {
            if let Ok(instruction) = Instruction::decode(&self.program.code, self.ip)
            {
                self.trace_instruction(self.ip, &instruction);
            }
            self.trace_state();
        }
        self.halted = true;
        debug!(ip = self.ip, sp = self.stack_pointer(), "halted");
    }

    fn execute(&mut self, instruction: &Instruction) -> Result<(), VmError> {
        match instruction.opcode() {
            Opcode::Halt => self.halted = true,

            Opcode::IAdd => self.binary_int(|l, r| l.wrapping_add(r).into())?,
            Opcode::ISub => self.binary_int(|l, r| l.wrapping_sub(r).into())?,
            Opcode::IMul => self.binary_int(|l, r| l.wrapping_mul(r).into())?,
            Opcode::IDiv => {
                let right = self.pop_int()?;
                let left = self.pop_int()?;
                if right == 0 {
                    return Err(VmError::DivisionByZero {
                        address: self.address,
                    });
                }
                self.push(left.wrapping_div(right).into())?;
            }
            Opcode::INeg => {
                let value = self.pop_int()?;
                self.push(value.wrapping_neg().into())?;
            }

            Opcode::IEq => self.binary_int(|l, r| (l == r).into())?,
            Opcode::INeq => self.binary_int(|l, r| (l != r).into())?,
            Opcode::ILt => self.binary_int(|l, r| (l < r).into())?,
            Opcode::ILe => self.binary_int(|l, r| (l <= r).into())?,
            Opcode::IGt => self.binary_int(|l, r| (l > r).into())?,
            Opcode::IGe => self.binary_int(|l, r| (l >= r).into())?,

            Opcode::Or => self.binary_bool(|l, r| l || r)?,
            Opcode::And => self.binary_bool(|l, r| l && r)?,
            Opcode::Not => {
                let value = self.pop_bool()?;
                self.push((!value).into())?;
            }

            Opcode::SAdd => {
                let right = self.pop_string_operand()?;
                let left = self.pop_string_operand()?;
                let joined = VmString::concat(left.as_ref(), right.as_ref())
                    .map_err(|source| VmError::String {
                        address: self.address,
                        source,
                    })?;
                self.push(joined.into())?;
            }
            Opcode::SEq => self.binary_str(VmString::equal)?,
            Opcode::SNeq => self.binary_str(VmString::not_equal)?,
            Opcode::SGt => self.binary_str(VmString::greater_than)?,
            Opcode::SGe => self.binary_str(VmString::greater_than_or_equal)?,
            Opcode::SLt => self.binary_str(VmString::less_than)?,
            Opcode::SLe => self.binary_str(VmString::less_than_or_equal)?,
            Opcode::SIndex => {
                let index = self.pop_int()?;
                let string = self.pop_string()?;
                let character =
                    string.byte_at(index).map_err(|source| VmError::String {
                        address: self.address,
                        source,
                    })?;
                self.push(character.into())?;
            }
            Opcode::SLen => {
                let string = self.pop_string()?;
                self.push((string.len() as i32).into())?;
            }
            Opcode::I2s => {
                let value = self.pop_int()?;
                self.push(VmString::from_int(value).into())?;
            }

            Opcode::Br => {
                self.ip = self.branch_target(instruction.operand(0))?;
            }
            Opcode::Brf => {
                let target = self.branch_target(instruction.operand(0))?;
                if !self.pop_bool()? {
                    self.ip = target;
                }
            }

            Opcode::IConst => self.push(instruction.operand(0).into())?,
            Opcode::SConst => {
                let index = instruction.operand(0);
                let string = usize::try_from(index)
                    .ok()
                    .and_then(|index| self.program.strings.get(index))
                    .cloned()
                    .ok_or(VmError::BadConstant {
                        address: self.address,
                        index,
                        count: self.program.strings.len(),
                    })?;
                self.push(string.into())?;
            }

            Opcode::Load => {
                let slot = self.local_slot(instruction.operand(0))?;
                let value = self.current_frame().locals[slot].clone();
                self.push(value)?;
            }
            Opcode::Store => {
                let slot = self.local_slot(instruction.operand(0))?;
                let value = self.pop()?;
                self.current_frame_mut().locals[slot] = value;
            }
            Opcode::SFree => {
                let slot = self.local_slot(instruction.operand(0))?;
                let held = &self.current_frame().locals[slot];
                if !matches!(held, Element::Str(_) | Element::Empty) {
                    return Err(self.type_mismatch("string", held.type_name()));
                }
                self.current_frame_mut().locals[slot] = Element::Empty;
            }
            Opcode::Locals => {
                let requested = instruction.operand(0);
                let capacity = self.config.locals_capacity;
                let frame = self.current_frame_mut();
                match usize::try_from(requested) {
                    Ok(n) if frame.nargs + n <= capacity => frame.nlocals = n,
                    _ => {
                        return Err(VmError::TooManyLocals {
                            function: frame.name.clone(),
                            requested: frame.nargs as i64 + requested as i64,
                            capacity,
                        })
                    }
                }
            }

            Opcode::Pop => {
                self.pop()?;
            }
            Opcode::Print => {
                let value = self.pop()?;
                value.write_to(&mut self.output);
                self.output.push(b'\n');
            }

            Opcode::Call => self.call(instruction.operand(0), instruction.operand(1))?,
            Opcode::Ret => {
                let frame = self.frames.pop();
                self.ip = frame
                    .and_then(|frame| frame.return_address)
                    .unwrap_or(self.program.len());
            }
        }
        Ok(())
    }

    fn call(&mut self, target: i32, nargs: i32) -> Result<(), VmError> {
        let capacity = self.config.locals_capacity;
        let count = usize::try_from(nargs)
            .ok()
            .filter(|&count| count <= capacity)
            .ok_or(VmError::ArgumentCount {
                address: self.address,
                nargs,
                capacity,
            })?;
        if self.frames.len() >= self.config.call_stack_capacity {
            return Err(VmError::CallStackOverflow {
                capacity: self.config.call_stack_capacity,
            });
        }
        let target = self.branch_target(target)?;

        let name = self
            .program
            .functions
            .name_at(target as u32)
            .map(str::to_string)
            .unwrap_or_else(|| format!("@{}", target));
        let mut frame = Frame::new(name, Some(self.ip), capacity);
        frame.nargs = count;
        for slot in (0..count).rev() {
            frame.locals[slot] = self.pop()?;
        }

        debug!(address = target, nargs = count, depth = self.frames.len() + 1, "call");
        self.frames.push(frame);
        self.ip = target;
        Ok(())
    }

    fn current_frame(&self) -> &Frame {
        &self.frames[self.frames.len() - 1]
    }

    fn current_frame_mut(&mut self) -> &mut Frame {
        let index = self.frames.len() - 1;
        &mut self.frames[index]
    }

    fn push(&mut self, element: Element) -> Result<(), VmError> {
        if self.stack.len() >= self.config.stack_capacity {
            return Err(VmError::StackOverflow {
                capacity: self.config.stack_capacity,
            });
        }
        self.stack.push(element);
        Ok(())
    }

    fn pop(&mut self) -> Result<Element, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow {
            address: self.address,
        })
    }

    fn pop_int(&mut self) -> Result<i32, VmError> {
        match self.pop()? {
            Element::Integer(value) => Ok(value),
            other => Err(self.type_mismatch("integer", other.type_name())),
        }
    }

    fn pop_bool(&mut self) -> Result<bool, VmError> {
        match self.pop()? {
            Element::Bool(value) => Ok(value),
            other => Err(self.type_mismatch("boolean", other.type_name())),
        }
    }

    fn pop_string(&mut self) -> Result<VmString, VmError> {
        match self.pop()? {
            Element::Str(value) => Ok(value),
            other => Err(self.type_mismatch("string", other.type_name())),
        }
    }

    fn pop_string_operand(&mut self) -> Result<Option<VmString>, VmError> {
        match self.pop()? {
            Element::Str(value) => Ok(Some(value)),
            Element::Empty => Ok(None),
            other => Err(self.type_mismatch("string", other.type_name())),
        }
    }

    fn binary_int(
        &mut self,
        operation: impl FnOnce(i32, i32) -> Element,
    ) -> Result<(), VmError> {
        let right = self.pop_int()?;
        let left = self.pop_int()?;
        self.push(operation(left, right))
    }

    fn binary_bool(
        &mut self,
        operation: impl FnOnce(bool, bool) -> bool,
    ) -> Result<(), VmError> {
        let right = self.pop_bool()?;
        let left = self.pop_bool()?;
        self.push(operation(left, right).into())
    }

    fn binary_str(
        &mut self,
        operation: impl FnOnce(&VmString, &VmString) -> bool,
    ) -> Result<(), VmError> {
        let right = self.pop_string()?;
        let left = self.pop_string()?;
        self.push(operation(&left, &right).into())
    }

    fn type_mismatch(&self, expected: &'static str, found: &'static str) -> VmError {
        VmError::TypeMismatch {
            opcode: self.opcode.mnemonic(),
            address: self.address,
            expected,
            found,
        }
    }

    fn branch_target(&self, target: i32) -> Result<usize, VmError> {
        usize::try_from(target)
            .ok()
            .filter(|&target| target < self.program.len())
            .ok_or(VmError::BadTarget {
                opcode: self.opcode.mnemonic(),
                address: self.address,
                target,
                length: self.program.len(),
            })
    }

    fn local_slot(&self, slot: i32) -> Result<usize, VmError> {
        let frame = self.current_frame();
        usize::try_from(slot)
            .ok()
            .filter(|&slot| slot < frame.declared())
            .ok_or_else(|| VmError::LocalOutOfRange {
                opcode: self.opcode.mnemonic(),
                address: self.address,
                slot,
                declared: frame.declared(),
                function: frame.name.clone(),
            })
    }

    fn trace_instruction(&mut self, address: usize, instruction: &Instruction) {
        let mnemonic = instruction.opcode().mnemonic();
        let _ = match instruction.operands() {
            [] => write!(self.trace, "{:04}:  {:<25}", address, mnemonic),
            [operand] => {
                write!(self.trace, "{:04}:  {:<15}{:<10}", address, mnemonic, operand)
            }
            [first, second, ..] => write!(
                self.trace,
                "{:04}:  {:<15}{:<10}",
                address,
                mnemonic,
                format!("{}, {}", first, second)
            ),
        };
    }

    fn trace_state(&mut self) {
        let sp = self.stack_pointer();
        let out = &mut self.trace;
        out.extend_from_slice(b"calls=[");
        for frame in &self.frames {
            let _ = write!(out, " {}=[", frame.name);
            for element in frame.declared_locals() {
                out.push(b' ');
                element.write_trace(out);
            }
            out.extend_from_slice(b" ]");
        }
        out.extend_from_slice(b" ]  stack=[");
        for element in &self.stack {
            out.push(b' ');
            element.write_trace(out);
        }
        let _ = writeln!(out, " ] sp={}", sp);
    }
}
