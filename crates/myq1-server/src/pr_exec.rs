// pr_exec.rs — gameplay program interpreter
//
// Copyright (C) 1996-1997 Id Software, Inc.
// Licensed under the GNU General Public License v2 or later.

use myq1_common::common::com_printf;

use crate::pr_cmds::BUILTINS;
use crate::progs::*;
use crate::server::*;

use thiserror::Error;

/// Statements one `execute_program` call may run before it is aborted.
pub const RUNAWAY_LIMIT: u32 = 100_000;

/// A runtime fault raised by the running program.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum VmFault {
    #[error("stack overflow")]
    StackOverflow,
    #[error("locals stack overflow")]
    LocalStackOverflow,
    #[error("stack underflow")]
    StackUnderflow,
    #[error("bad field offset {0}")]
    BadField(i32),
    #[error("bad entity {0}")]
    BadEntity(i32),
    #[error("bad pointer {0}")]
    BadPointer(i32),
    #[error("statement {0} out of range")]
    BadStatement(i32),
    #[error("bad opcode {0}")]
    BadOpcode(u16),
    #[error("NULL function")]
    NullFunction,
    #[error("bad function {0}")]
    BadFunction(i32),
    #[error("bad builtin call number {0}")]
    BadBuiltin(usize),
    #[error("unimplemented builtin {0}")]
    UnimplementedBuiltin(usize),
    #[error("division by zero")]
    DivideByZero,
    #[error("runaway loop error")]
    Runaway,
    #[error("assignment to world entity")]
    WorldAssignment,
    #[error("{0}")]
    Script(String),
}

/// Why a call into the program did not finish.
#[derive(Debug, Error)]
pub enum VmError {
    /// Recoverable: the call chain is abandoned, the level goes on.
    #[error("{function}: {fault}")]
    Fault { function: String, fault: VmFault },
    /// Fatal to the running level.
    #[error(transparent)]
    Host(#[from] HostError),
}

impl VmError {
    pub fn fault(&self) -> Option<&VmFault> {
        match self {
            VmError::Fault { fault, .. } => Some(fault),
            VmError::Host(_) => None,
        }
    }
}

impl ServerContext {
    /// Run program function `fnum` to completion.
    ///
    /// Builtins may re-enter; each nested call returns once the call stack
    /// is back to the depth it started at.
    pub fn execute_program(&mut self, fnum: i32) -> Result<(), VmError> {
        if fnum <= 0 || fnum as usize >= self.pr.dat.functions.len() {
            return Err(self.run_error(VmFault::NullFunction));
        }

        let exitdepth = self.pr.stack.len();
        let mut s = self.enter_function(fnum as usize)?;
        let mut runaway = RUNAWAY_LIMIT;

        loop {
            s += 1; // next statement

            let Some(&st) = usize::try_from(s).ok().and_then(|i| self.pr.dat.statements.get(i)) else {
                return Err(self.run_error(VmFault::BadStatement(s)));
            };

            runaway -= 1;
            if runaway == 0 {
                return Err(self.run_error(VmFault::Runaway));
            }

            if let Some(p) = self.pr.profile.get_mut(self.pr.xfunction) {
                *p += 1;
            }
            self.pr.xstatement = s;

            if self.pr.trace {
                log::trace!("{}", self.statement_string(&st));
            }

            let Some(op) = Opcode::from_u16(st.op) else {
                return Err(self.run_error(VmFault::BadOpcode(st.op)));
            };
            let (a, b, c) = (st.ga(), st.gb(), st.gc());

            use Opcode::*;
            match op {
                ADD_F => {
                    let v = self.pr.g_float(a) + self.pr.g_float(b);
                    self.pr.set_g_float(c, v);
                }
                ADD_V => {
                    let v = vec_op(self.pr.g_vector(a), self.pr.g_vector(b), |x, y| x + y);
                    self.pr.set_g_vector(c, &v);
                }
                SUB_F => {
                    let v = self.pr.g_float(a) - self.pr.g_float(b);
                    self.pr.set_g_float(c, v);
                }
                SUB_V => {
                    let v = vec_op(self.pr.g_vector(a), self.pr.g_vector(b), |x, y| x - y);
                    self.pr.set_g_vector(c, &v);
                }
                MUL_F => {
                    let v = self.pr.g_float(a) * self.pr.g_float(b);
                    self.pr.set_g_float(c, v);
                }
                MUL_V => {
                    let (x, y) = (self.pr.g_vector(a), self.pr.g_vector(b));
                    self.pr.set_g_float(c, x[0] * y[0] + x[1] * y[1] + x[2] * y[2]);
                }
                MUL_FV => {
                    let (f, v) = (self.pr.g_float(a), self.pr.g_vector(b));
                    self.pr.set_g_vector(c, &[f * v[0], f * v[1], f * v[2]]);
                }
                MUL_VF => {
                    let (v, f) = (self.pr.g_vector(a), self.pr.g_float(b));
                    self.pr.set_g_vector(c, &[f * v[0], f * v[1], f * v[2]]);
                }
                DIV_F => {
                    let d = self.pr.g_float(b);
                    if d == 0.0 {
                        return Err(self.run_error(VmFault::DivideByZero));
                    }
                    let v = self.pr.g_float(a) / d;
                    self.pr.set_g_float(c, v);
                }

                BITAND => {
                    let v = (self.pr.g_float(a) as i32) & (self.pr.g_float(b) as i32);
                    self.pr.set_g_float(c, v as f32);
                }
                BITOR => {
                    let v = (self.pr.g_float(a) as i32) | (self.pr.g_float(b) as i32);
                    self.pr.set_g_float(c, v as f32);
                }

                GE => self.set_bool(c, self.pr.g_float(a) >= self.pr.g_float(b)),
                LE => self.set_bool(c, self.pr.g_float(a) <= self.pr.g_float(b)),
                GT => self.set_bool(c, self.pr.g_float(a) > self.pr.g_float(b)),
                LT => self.set_bool(c, self.pr.g_float(a) < self.pr.g_float(b)),
                AND => self.set_bool(c, self.pr.g_float(a) != 0.0 && self.pr.g_float(b) != 0.0),
                OR => self.set_bool(c, self.pr.g_float(a) != 0.0 || self.pr.g_float(b) != 0.0),

                NOT_F => self.set_bool(c, self.pr.g_float(a) == 0.0),
                NOT_V => self.set_bool(c, self.pr.g_vector(a) == [0.0; 3]),
                NOT_S => {
                    let id = self.pr.g_int(a);
                    let empty = id == 0 || self.pr.get_string(id).is_empty();
                    self.set_bool(c, empty);
                }
                NOT_FNC | NOT_ENT => self.set_bool(c, self.pr.g_int(a) == 0),

                EQ_F => self.set_bool(c, self.pr.g_float(a) == self.pr.g_float(b)),
                EQ_V => self.set_bool(c, self.pr.g_vector(a) == self.pr.g_vector(b)),
                EQ_S => self.set_bool(c, self.strings_equal(a, b)),
                EQ_E | EQ_FNC => self.set_bool(c, self.pr.g_int(a) == self.pr.g_int(b)),

                NE_F => self.set_bool(c, self.pr.g_float(a) != self.pr.g_float(b)),
                NE_V => self.set_bool(c, self.pr.g_vector(a) != self.pr.g_vector(b)),
                NE_S => self.set_bool(c, !self.strings_equal(a, b)),
                NE_E | NE_FNC => self.set_bool(c, self.pr.g_int(a) != self.pr.g_int(b)),

                STORE_F | STORE_ENT | STORE_FLD | STORE_S | STORE_FNC => {
                    self.pr.globals[b] = self.pr.globals[a];
                }
                STORE_V => {
                    for i in 0..3 {
                        self.pr.globals[b + i] = self.pr.globals[a + i];
                    }
                }

                STOREP_F | STOREP_ENT | STOREP_FLD | STOREP_S | STOREP_FNC | STOREP_V => {
                    let width = if op == STOREP_V { 3 } else { 1 };
                    let (e, ofs) = self.decode_pointer(self.pr.g_int(b), width)?;
                    for i in 0..width {
                        self.sv.edicts[e].v[ofs + i] = self.pr.globals[a + i];
                    }
                }

                ADDRESS => {
                    let e = self.check_entity(self.pr.g_int(a))?;
                    let ofs = self.check_field(self.pr.g_int(b), 1)?;
                    if e == 0 && self.sv.state == ServerState::Active {
                        return Err(self.run_error(VmFault::WorldAssignment));
                    }
                    let ptr = (e * self.pr.entityfields() + ofs) as i32;
                    self.pr.globals[c] = Cell::Int(ptr);
                }

                LOAD_F | LOAD_FLD | LOAD_ENT | LOAD_S | LOAD_FNC | LOAD_V => {
                    let width = if op == LOAD_V { 3 } else { 1 };
                    let e = self.check_entity(self.pr.g_int(a))?;
                    let ofs = self.check_field(self.pr.g_int(b), width)?;
                    for i in 0..width {
                        self.pr.globals[c + i] = self.sv.edicts[e].v[ofs + i];
                    }
                }

                IFNOT => {
                    if self.pr.globals[a].is_zero() {
                        s += st.b as i32 - 1; // offset the s++
                    }
                }
                IF => {
                    if !self.pr.globals[a].is_zero() {
                        s += st.b as i32 - 1;
                    }
                }
                GOTO => {
                    s += st.a as i32 - 1;
                }

                CALL0 | CALL1 | CALL2 | CALL3 | CALL4 | CALL5 | CALL6 | CALL7 | CALL8 => {
                    self.pr.argc = (op as u16 - CALL0 as u16) as usize;
                    let fnum = self.pr.g_int(a);
                    if fnum == 0 {
                        return Err(self.run_error(VmFault::NullFunction));
                    }
                    let Some(f) = usize::try_from(fnum).ok().and_then(|i| self.pr.dat.functions.get(i)) else {
                        return Err(self.run_error(VmFault::BadFunction(fnum)));
                    };

                    if f.first_statement < 0 {
                        // negative statements are built in functions
                        let i = (-f.first_statement) as usize;
                        let Some(builtin) = BUILTINS.get(i) else {
                            return Err(self.run_error(VmFault::BadBuiltin(i)));
                        };
                        if self.pr.builtin_profile.len() != BUILTINS.len() {
                            self.pr.builtin_profile.resize(BUILTINS.len(), 0);
                        }
                        let Some(func) = builtin.func else {
                            return Err(self.run_error(VmFault::UnimplementedBuiltin(i)));
                        };
                        self.pr.builtin_profile[i] += 1;
                        func(self)?;
                    } else {
                        s = self.enter_function(fnum as usize)?;
                    }
                }

                DONE | RETURN => {
                    for i in 0..3 {
                        self.pr.globals[OFS_RETURN + i] = self.pr.globals[a + i];
                    }
                    s = self.leave_function()?;
                    if self.pr.stack.len() == exitdepth {
                        return Ok(()); // all done
                    }
                }

                STATE => {
                    let me = self.check_entity(self.pr.g_int(gv::SELF))?;
                    let nextthink = self.pr.g_float(gv::TIME) + 0.1;
                    let frame = self.pr.g_float(a);
                    let think = self.pr.g_int(b);
                    let ed = &mut self.sv.edicts[me];
                    ed.set_float(ev::NEXTTHINK, nextthink);
                    if frame != ed.float(ev::FRAME) {
                        ed.set_float(ev::FRAME, frame);
                    }
                    ed.set_function(ev::THINK, think);
                }
            }
        }
    }

    /// Returns the new program statement counter.
    fn enter_function(&mut self, fnum: usize) -> Result<i32, VmError> {
        if self.pr.stack.len() >= MAX_STACK_DEPTH {
            return Err(self.run_error(VmFault::StackOverflow));
        }
        let f = self.pr.dat.functions[fnum];
        let start = f.parm_start as usize;
        let count = f.locals as usize;

        // save off any locals that the new function steps on
        if self.pr.localstack.len() + count > LOCALSTACK_SIZE {
            return Err(self.run_error(VmFault::LocalStackOverflow));
        }

        self.pr.stack.push(StackFrame { s: self.pr.xstatement, f: self.pr.xfunction });
        let saved = &self.pr.globals[start..start + count];
        self.pr.localstack.extend_from_slice(saved);

        // copy parameters
        let mut o = start;
        for i in 0..(f.numparms.max(0) as usize).min(MAX_PARMS) {
            for j in 0..(f.parm_size[i] as usize).min(3) {
                if o >= self.pr.globals.len() {
                    return Err(self.run_error(VmFault::BadFunction(fnum as i32)));
                }
                self.pr.globals[o] = self.pr.globals[ofs_parm(i) + j];
                o += 1;
            }
        }

        self.pr.xfunction = fnum;
        Ok(f.first_statement - 1) // offset the s++
    }

    fn leave_function(&mut self) -> Result<i32, VmError> {
        let Some(frame) = self.pr.stack.last().copied() else {
            return Err(self.run_error(VmFault::StackUnderflow));
        };

        // restore locals from the stack
        let f = self.pr.dat.functions[self.pr.xfunction];
        let start = f.parm_start as usize;
        let count = f.locals as usize;
        let Some(base) = self.pr.localstack.len().checked_sub(count) else {
            return Err(self.run_error(VmFault::StackUnderflow));
        };
        for (i, cell) in self.pr.localstack.drain(base..).enumerate() {
            self.pr.globals[start + i] = cell;
        }

        // up stack
        self.pr.stack.pop();
        self.pr.xfunction = frame.f;
        Ok(frame.s)
    }

    #[inline]
    fn set_bool(&mut self, ofs: usize, v: bool) {
        self.pr.set_g_float(ofs, if v { 1.0 } else { 0.0 });
    }

    fn strings_equal(&self, a: usize, b: usize) -> bool {
        self.pr.get_string(self.pr.g_int(a)) == self.pr.get_string(self.pr.g_int(b))
    }

    /// The program's `self`, faulting if it names no slot.
    pub(crate) fn self_checked(&self) -> Result<usize, VmError> {
        self.check_entity(self.pr.g_int(gv::SELF))
    }

    /// Entity field `ofs` of edict `e`, faulting if it names no slot.
    pub(crate) fn entity_field_checked(&self, e: usize, ofs: usize) -> Result<usize, VmError> {
        let value = self.sv.edicts.get(e).and_then(|ed| ed.v.get(ofs)).map_or(-1, |c| c.as_int());
        self.check_entity(value)
    }

    fn check_entity(&self, e: i32) -> Result<usize, VmError> {
        match usize::try_from(e) {
            Ok(e) if e < self.sv.num_edicts() => Ok(e),
            _ => Err(self.run_error(VmFault::BadEntity(e))),
        }
    }

    fn check_field(&self, ofs: i32, width: usize) -> Result<usize, VmError> {
        match usize::try_from(ofs) {
            Ok(o) if o + width <= self.pr.entityfields() => Ok(o),
            _ => Err(self.run_error(VmFault::BadField(ofs))),
        }
    }

    /// Split an entity field pointer into edict number and field offset.
    fn decode_pointer(&self, ptr: i32, width: usize) -> Result<(usize, usize), VmError> {
        let ef = self.pr.entityfields();
        let Ok(p) = usize::try_from(ptr) else {
            return Err(self.run_error(VmFault::BadPointer(ptr)));
        };
        let (e, ofs) = (p / ef, p % ef);
        if e >= self.sv.num_edicts() || ofs + width > ef {
            return Err(self.run_error(VmFault::BadPointer(ptr)));
        }
        Ok((e, ofs))
    }

    /// Log where the program was when `fault` happened and wrap it up for
    /// the caller.
    pub fn run_error(&self, fault: VmFault) -> VmError {
        let function = self.pr.dat.function_name(self.pr.xfunction).into_owned();
        if let Some(st) = usize::try_from(self.pr.xstatement)
            .ok()
            .and_then(|i| self.pr.dat.statements.get(i))
        {
            log::error!("{}", self.statement_string(st));
        }
        for line in self.stack_trace() {
            log::error!("{}", line);
        }
        if let Some(dump) = self.self_dump() {
            log::error!("{}", dump);
        }
        log::error!("{}", fault);
        VmError::Fault { function, fault }
    }

    /// Field dump of the program's `self`, if it names a live slot.
    pub fn self_dump(&self) -> Option<String> {
        let me = usize::try_from(self.pr.g_int(gv::SELF)).ok()?;
        (me < self.sv.num_edicts()).then(|| self.ed_print(me))
    }

    /// One line per active call, innermost first.
    pub fn stack_trace(&self) -> Vec<String> {
        if self.pr.stack.is_empty() {
            return vec!["<NO STACK>".to_string()];
        }
        let mut lines = Vec::with_capacity(self.pr.stack.len());
        let mut f = self.pr.xfunction;
        for frame in self.pr.stack.iter().rev() {
            match self.pr.dat.functions.get(f) {
                Some(func) if f != 0 => lines.push(format!(
                    "{:>12} : {}",
                    self.pr.dat.string_at(func.s_file),
                    self.pr.dat.string_at(func.s_name)
                )),
                _ => lines.push("<NO FUNCTION>".to_string()),
            }
            f = frame.f;
        }
        lines
    }

    pub fn statement_string(&self, st: &Statement) -> String {
        let mut out = match Opcode::from_u16(st.op) {
            Some(op) => format!("{:<10}", op.name()),
            None => format!("{:<10}", st.op),
        };
        let op = Opcode::from_u16(st.op);
        match op {
            Some(Opcode::IF) | Some(Opcode::IFNOT) => {
                out += &format!("{}branch {}", self.global_string(st.ga()), st.b);
            }
            Some(Opcode::GOTO) => {
                out += &format!("branch {}", st.a);
            }
            Some(op)
                if matches!(
                    op,
                    Opcode::STORE_F
                        | Opcode::STORE_V
                        | Opcode::STORE_S
                        | Opcode::STORE_ENT
                        | Opcode::STORE_FLD
                        | Opcode::STORE_FNC
                        | Opcode::STOREP_F
                        | Opcode::STOREP_V
                        | Opcode::STOREP_S
                        | Opcode::STOREP_ENT
                        | Opcode::STOREP_FLD
                        | Opcode::STOREP_FNC
                ) =>
            {
                out += &self.global_string(st.ga());
                out += &self.global_string_no_contents(st.gb());
            }
            _ => {
                if st.a != 0 {
                    out += &self.global_string(st.ga());
                }
                if st.b != 0 {
                    out += &self.global_string(st.gb());
                }
                if st.c != 0 {
                    out += &self.global_string_no_contents(st.gc());
                }
            }
        }
        out
    }

    /// A global's offset, name and value, padded for statement listings.
    pub fn global_string(&self, ofs: usize) -> String {
        let s = match self.pr.dat.global_at_ofs(ofs) {
            None => format!("{}(???)", ofs),
            Some(def) => {
                let etype = def.etype().unwrap_or(Etype::Void);
                let end = (ofs + etype.width()).min(self.pr.globals.len());
                let value = self.value_string(etype, &self.pr.globals[ofs.min(end)..end]);
                format!("{}({}){}", ofs, self.pr.dat.string_at(def.s_name), value)
            }
        };
        format!("{:<20}", s)
    }

    pub fn global_string_no_contents(&self, ofs: usize) -> String {
        let s = match self.pr.dat.global_at_ofs(ofs) {
            None => format!("{}(???)", ofs),
            Some(def) => format!("{}({})", ofs, self.pr.dat.string_at(def.s_name)),
        };
        format!("{:<20}", s)
    }

    /// Print the ten busiest functions since the last report and reset
    /// their counters.
    pub fn pr_profile(&mut self) -> Vec<(String, u32)> {
        let mut counts: Vec<(usize, u32)> = self
            .pr
            .profile
            .iter()
            .copied()
            .enumerate()
            .filter(|&(_, n)| n > 0)
            .collect();
        counts.sort_by(|x, y| y.1.cmp(&x.1));
        counts.truncate(10);

        let report: Vec<(String, u32)> = counts
            .into_iter()
            .map(|(f, n)| (self.pr.dat.function_name(f).into_owned(), n))
            .collect();
        for (name, n) in &report {
            com_printf(&format!("{:7} {}\n", n, name));
        }
        self.pr.profile.iter_mut().for_each(|p| *p = 0);
        report
    }
}

#[inline]
fn vec_op(x: [f32; 3], y: [f32; 3], f: impl Fn(f32, f32) -> f32) -> [f32; 3] {
    [f(x[0], y[0]), f(x[1], y[1]), f(x[2], y[2])]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progs::testprogs::{context_with, ProgsBuilder};
    use assert_approx_eq::assert_approx_eq;

    fn fault_of(r: Result<(), VmError>) -> VmFault {
        match r {
            Err(VmError::Fault { fault, .. }) => fault,
            other => panic!("expected a fault, got {:?}", other),
        }
    }

    #[test]
    fn test_arithmetic() {
        let mut b = ProgsBuilder::new();
        let x = b.float_const(3.0);
        let y = b.float_const(4.0);
        let two = b.float_const(2.0);
        let r = b.alloc_globals(1);
        let f = b.function("main", 0, 0, 0);
        b.op(Opcode::MUL_F, x, y, r);
        b.op(Opcode::DIV_F, r, two, r);
        b.op(Opcode::SUB_F, r, x, r);
        b.op(Opcode::DONE, 0, 0, 0);

        let mut ctx = context_with(&b);
        ctx.execute_program(f as i32).unwrap();
        assert_approx_eq!(ctx.pr.g_float(r), 3.0);
        assert!(ctx.pr.stack.is_empty());
    }

    #[test]
    fn test_vector_ops() {
        let mut b = ProgsBuilder::new();
        let v = b.alloc_globals(3);
        for (i, c) in [1.0, 2.0, 3.0].into_iter().enumerate() {
            b.set_float(v + i, c);
        }
        let k = b.float_const(2.0);
        let scaled = b.alloc_globals(3);
        let dot = b.alloc_globals(1);
        let f = b.function("main", 0, 0, 0);
        b.op(Opcode::MUL_VF, v, k, scaled);
        b.op(Opcode::MUL_V, v, scaled, dot);
        b.op(Opcode::DONE, 0, 0, 0);

        let mut ctx = context_with(&b);
        ctx.execute_program(f as i32).unwrap();
        assert_eq!(ctx.pr.g_vector(scaled), [2.0, 4.0, 6.0]);
        assert_approx_eq!(ctx.pr.g_float(dot), 28.0);
    }

    #[test]
    fn test_divide_by_zero_faults() {
        let mut b = ProgsBuilder::new();
        let x = b.float_const(1.0);
        let zero = b.float_const(0.0);
        let r = b.alloc_globals(1);
        let f = b.function("divide", 0, 0, 0);
        b.op(Opcode::DIV_F, x, zero, r);
        b.op(Opcode::DONE, 0, 0, 0);

        let mut ctx = context_with(&b);
        let err = ctx.execute_program(f as i32).unwrap_err();
        assert!(matches!(&err, VmError::Fault { function, fault: VmFault::DivideByZero } if function == "divide"));
        ctx.contain_fault(Err(err)).unwrap();
        assert!(ctx.pr.stack.is_empty());
    }

    #[test]
    fn test_call_and_return_restore_locals() {
        let mut b = ProgsBuilder::new();
        let three = b.float_const(3.0);
        let result = b.alloc_globals(1);
        let locals = b.alloc_globals(2); // parameter and temporary
        b.set_float(locals, 99.0);

        let double = b.function("double", 1, locals, 2);
        b.op(Opcode::ADD_F, locals, locals, locals + 1);
        b.op(Opcode::RETURN, locals + 1, 0, 0);
        let double_g = b.function_global(double);

        let main = b.function("main", 0, 0, 0);
        b.op(Opcode::STORE_F, three, OFS_PARM0, 0);
        b.op(Opcode::CALL1, double_g, 0, 0);
        b.op(Opcode::STORE_F, OFS_RETURN, result, 0);
        b.op(Opcode::DONE, 0, 0, 0);

        let mut ctx = context_with(&b);
        ctx.execute_program(main as i32).unwrap();
        assert_eq!(ctx.pr.g_float(result), 6.0);
        assert_eq!(ctx.pr.g_float(locals), 99.0, "caller's view of the locals is restored");
        assert!(ctx.pr.stack.is_empty());
        assert!(ctx.pr.localstack.is_empty());
        assert_eq!(ctx.pr.profile[double], 2);
    }

    #[test]
    fn test_fault_reports_self() {
        let mut b = ProgsBuilder::new();
        let grudge = b.field("grudge", 2);
        let x = b.float_const(1.0);
        let zero = b.float_const(0.0);
        let r = b.alloc_globals(1);
        let f = b.function("divide", 0, 0, 0);
        b.op(Opcode::DIV_F, x, zero, r);
        b.op(Opcode::DONE, 0, 0, 0);

        let mut ctx = context_with(&b);
        let e = ctx.ed_alloc().unwrap();
        ctx.edict_mut(e).set_float(grudge, 35.0);
        ctx.pr.set_g_edict(gv::SELF, e);
        let dump = ctx.self_dump().unwrap();
        assert!(dump.contains(&format!("EDICT {}:", e)), "{}", dump);
        assert!(dump.contains("grudge"), "{}", dump);

        let err = ctx.execute_program(f as i32).unwrap_err();
        ctx.contain_fault(Err(err)).unwrap();
        assert!(ctx.pr.stack.is_empty());

        // a stale self still faults cleanly
        ctx.pr.set_g_edict(gv::SELF, 4000);
        assert!(ctx.self_dump().is_none());
        assert_eq!(fault_of(ctx.execute_program(f as i32)), VmFault::DivideByZero);
        ctx.pr.globals[gv::SELF] = Cell::Entity(-3);
        assert!(ctx.self_dump().is_none());
        assert_eq!(fault_of(ctx.execute_program(f as i32)), VmFault::DivideByZero);
    }

    #[test]
    fn test_fault_in_nested_call_restores_caller_locals() {
        let mut b = ProgsBuilder::new();
        let one = b.float_const(1.0);
        let zero = b.float_const(0.0);
        let locals = b.alloc_globals(2);
        b.set_float(locals, 7.0);
        b.set_float(locals + 1, 8.0);

        let inner = b.function("inner", 1, locals, 2);
        b.op(Opcode::DIV_F, one, zero, locals + 1);
        b.op(Opcode::DONE, 0, 0, 0);
        let inner_g = b.function_global(inner);

        let outer = b.function("outer", 0, 0, 0);
        b.op(Opcode::STORE_F, one, OFS_PARM0, 0);
        b.op(Opcode::CALL1, inner_g, 0, 0);
        b.op(Opcode::DONE, 0, 0, 0);

        let mut ctx = context_with(&b);
        let r = ctx.execute_program(outer as i32);
        assert_eq!(ctx.pr.g_float(locals), 1.0, "parameter copied in");
        assert_eq!(fault_of(r), VmFault::DivideByZero);

        ctx.pr.reset_stack();
        assert_approx_eq!(ctx.pr.g_float(locals), 7.0);
        assert_approx_eq!(ctx.pr.g_float(locals + 1), 8.0);
        assert!(ctx.pr.stack.is_empty());
        assert!(ctx.pr.localstack.is_empty());
        assert_eq!(ctx.pr.xfunction, 0);
    }

    #[test]
    fn test_unbounded_recursion_overflows() {
        let mut b = ProgsBuilder::new();
        let slot = b.alloc_globals(1);
        let f = b.function("recurse", 0, 0, 0);
        b.op(Opcode::CALL0, slot, 0, 0);
        b.op(Opcode::DONE, 0, 0, 0);
        b.set_int(slot, f as i32);

        let mut ctx = context_with(&b);
        let r = ctx.execute_program(f as i32);
        assert_eq!(ctx.pr.stack.len(), MAX_STACK_DEPTH);
        assert_eq!(fault_of(r), VmFault::StackOverflow);
        ctx.pr.reset_stack();
        assert!(ctx.pr.stack.is_empty());
    }

    #[test]
    fn test_builtin_dispatch() {
        let mut b = ProgsBuilder::new();
        let v = b.alloc_globals(3);
        b.set_float(v, 3.0);
        b.set_float(v + 1, 4.0);
        let res = b.alloc_globals(1);
        let vlen = b.builtin("vlen", 12);
        let vlen_g = b.function_global(vlen);
        let f = b.function("main", 0, 0, 0);
        b.op(Opcode::STORE_V, v, OFS_PARM0, 0);
        b.op(Opcode::CALL1, vlen_g, 0, 0);
        b.op(Opcode::STORE_F, OFS_RETURN, res, 0);
        b.op(Opcode::DONE, 0, 0, 0);

        let mut ctx = context_with(&b);
        ctx.execute_program(f as i32).unwrap();
        assert_approx_eq!(ctx.pr.g_float(res), 5.0);
        assert_eq!(ctx.pr.argc, 1);
        assert_eq!(ctx.pr.builtin_profile[12], 1);
    }

    #[test]
    fn test_unimplemented_builtin_faults() {
        let mut b = ProgsBuilder::new();
        let fixme = b.builtin("fixme", 5);
        let g = b.function_global(fixme);
        let bad = b.builtin("beyond", 500);
        let bad_g = b.function_global(bad);
        let f = b.function("main", 0, 0, 0);
        b.op(Opcode::CALL0, g, 0, 0);
        b.op(Opcode::DONE, 0, 0, 0);
        let h = b.function("main2", 0, 0, 0);
        b.op(Opcode::CALL0, bad_g, 0, 0);
        b.op(Opcode::DONE, 0, 0, 0);

        let mut ctx = context_with(&b);
        assert_eq!(fault_of(ctx.execute_program(f as i32)), VmFault::UnimplementedBuiltin(5));
        ctx.pr.reset_stack();
        assert_eq!(fault_of(ctx.execute_program(h as i32)), VmFault::BadBuiltin(500));
    }

    #[test]
    fn test_null_function() {
        let mut b = ProgsBuilder::new();
        let zero = b.alloc_globals(1);
        let f = b.function("main", 0, 0, 0);
        b.op(Opcode::CALL0, zero, 0, 0);
        b.op(Opcode::DONE, 0, 0, 0);

        let mut ctx = context_with(&b);
        assert_eq!(fault_of(ctx.execute_program(0)), VmFault::NullFunction);
        assert_eq!(fault_of(ctx.execute_program(f as i32)), VmFault::NullFunction);
    }

    #[test]
    fn test_branch_loop() {
        let mut b = ProgsBuilder::new();
        let counter = b.alloc_globals(1);
        let ten = b.float_const(10.0);
        let one = b.float_const(1.0);
        let cond = b.alloc_globals(1);
        let f = b.function("count", 0, 0, 0);
        let top = b.op(Opcode::LT, counter, ten, cond);
        let test = b.op(Opcode::IFNOT, cond, 0, 0);
        b.op(Opcode::ADD_F, counter, one, counter);
        let back = b.op(Opcode::GOTO, 0, 0, 0);
        let done = b.op(Opcode::DONE, 0, 0, 0);
        b.jump(Opcode::IFNOT, cond, test, done);
        b.jump(Opcode::GOTO, 0, back, top);

        let mut ctx = context_with(&b);
        ctx.execute_program(f as i32).unwrap();
        assert_eq!(ctx.pr.g_float(counter), 10.0);
    }

    #[test]
    fn test_runaway_loop_is_stopped() {
        let mut b = ProgsBuilder::new();
        let f = b.function("spin", 0, 0, 0);
        let st = b.op(Opcode::GOTO, 0, 0, 0);
        b.jump(Opcode::GOTO, 0, st, st);

        let mut ctx = context_with(&b);
        assert_eq!(fault_of(ctx.execute_program(f as i32)), VmFault::Runaway);
    }

    #[test]
    fn test_state_sets_think() {
        let mut b = ProgsBuilder::new();
        let frame = b.float_const(5.0);
        let think = b.function("think", 0, 0, 0);
        b.op(Opcode::DONE, 0, 0, 0);
        let think_g = b.function_global(think);
        let f = b.function("main", 0, 0, 0);
        b.op(Opcode::STATE, frame, think_g, 0);
        b.op(Opcode::DONE, 0, 0, 0);

        let mut ctx = context_with(&b);
        let e = ctx.ed_alloc().unwrap();
        ctx.pr.set_g_edict(gv::SELF, e);
        ctx.pr.set_g_float(gv::TIME, 2.0);
        ctx.execute_program(f as i32).unwrap();
        let ed = ctx.edict(e);
        assert_approx_eq!(ed.float(ev::NEXTTHINK), 2.1);
        assert_eq!(ed.float(ev::FRAME), 5.0);
        assert_eq!(ed.function(ev::THINK), think as i32);
    }

    #[test]
    fn test_field_address_store_and_load() {
        let mut b = ProgsBuilder::new();
        let custom = b.field("custom", 2);
        let fld = b.alloc_globals(1);
        b.set_int(fld, custom as i32);
        let val = b.float_const(42.0);
        let ptr = b.alloc_globals(1);
        let back = b.alloc_globals(1);
        let f = b.function("main", 0, 0, 0);
        b.op(Opcode::ADDRESS, gv::SELF, fld, ptr);
        b.op(Opcode::STOREP_F, val, ptr, 0);
        b.op(Opcode::LOAD_F, gv::SELF, fld, back);
        b.op(Opcode::DONE, 0, 0, 0);

        let mut ctx = context_with(&b);
        let e = ctx.ed_alloc().unwrap();
        ctx.pr.set_g_edict(gv::SELF, e);
        ctx.execute_program(f as i32).unwrap();
        assert_eq!(ctx.edict(e).float(custom), 42.0);
        assert_eq!(ctx.pr.g_float(back), 42.0);

        // the world is read-only once the level runs
        ctx.sv.state = ServerState::Active;
        ctx.pr.set_g_edict(gv::SELF, 0);
        assert_eq!(fault_of(ctx.execute_program(f as i32)), VmFault::WorldAssignment);

        ctx.pr.reset_stack();
        ctx.pr.set_g_edict(gv::SELF, 400);
        assert_eq!(fault_of(ctx.execute_program(f as i32)), VmFault::BadEntity(400));
    }

    #[test]
    fn test_string_compare_by_contents() {
        let mut b = ProgsBuilder::new();
        let s1 = b.alloc_globals(1);
        let s2 = b.alloc_globals(1);
        let first = b.string("abc");
        let second = b.string("abc");
        b.set_int(s1, first);
        b.set_int(s2, second);
        let eq = b.alloc_globals(1);
        let empty = b.alloc_globals(1);
        let null = b.alloc_globals(1);
        let f = b.function("main", 0, 0, 0);
        b.op(Opcode::EQ_S, s1, s2, eq);
        b.op(Opcode::NOT_S, null, 0, empty);
        b.op(Opcode::DONE, 0, 0, 0);

        let mut ctx = context_with(&b);
        ctx.execute_program(f as i32).unwrap();
        assert_eq!(ctx.pr.g_float(eq), 1.0);
        assert_eq!(ctx.pr.g_float(empty), 1.0);
    }

    #[test]
    fn test_profile_report_resets() {
        let mut b = ProgsBuilder::new();
        let f = b.function("main", 0, 0, 0);
        b.op(Opcode::DONE, 0, 0, 0);
        let mut ctx = context_with(&b);
        ctx.execute_program(f as i32).unwrap();
        let report = ctx.pr_profile();
        assert_eq!(report, vec![("main".to_string(), 1)]);
        assert!(ctx.pr.profile.iter().all(|&p| p == 0));
    }
}
