//! The dispatch loop: 32-bit instruction words with immediate trailers,
//! executed over per-frame register windows.
//!
//! Conventions the whole file leans on:
//! - `pc` counts 4-byte words and already points past the fetched word
//!   (and past its immediate once consumed). Branch offsets are signed
//!   word deltas relative to that position.
//! - Integer arithmetic wraps (two's complement); shifts mask their
//!   amount to the operand width. Float→int conversions saturate.
//! - Every failure unwinds to the top-level caller; there is no local
//!   recovery.

use crate::bytecode::{self, MAX_PARAMS, Opcode};
use crate::module::FuncBody;
use crate::value::Value;
use crate::vm::host::HostContext;
use crate::vm::Vm;
use crate::{Error, Result};

impl Vm<'_> {
    /// Execute a function in the combined index space: imports dispatch
    /// straight to the host registry, locals get a frame and the loop.
    pub(crate) fn exec(&mut self, func_index: u32, args: &[Value]) -> Result<Value> {
        let module = self.module;
        let Some(func) = module.func(func_index) else {
            self.diag(format!("function index {func_index} out of range"));
            return Err(Error::BadModule(format!(
                "function index {func_index} out of range"
            )));
        };

        match &func.body {
            FuncBody::Import { import_index } => self.call_host(*import_index, args),
            FuncBody::Local(local) => {
                let code = module.code(local);
                self.stack.push(local.reg_count, args)?;
                tracing::trace!(func = func_index, depth = self.stack.depth(), "enter frame");
                let result = self.run(func_index, code);
                self.stack.pop();
                result
            }
        }
    }

    /// Dispatch a host call for an import index. The callback sees only
    /// the memory API through [`HostContext`]; its error, if any,
    /// propagates to the guest's top-level caller unchanged.
    fn call_host(&mut self, import_index: u32, args: &[Value]) -> Result<Value> {
        let module = self.module;
        let Some(import) = module.imports().get(import_index as usize) else {
            self.diag(format!("unresolved import index {import_index}"));
            return Err(Error::NoImport(format!("import index {import_index}")));
        };

        let Self { host, memory, .. } = self;
        let Some(entry) = host.resolve(&import.module, &import.name) else {
            return Err(Error::NoImport(format!(
                "{}::{}",
                import.module, import.name
            )));
        };
        let mut ctx = HostContext::new(memory.as_mut());
        (entry.func)(&mut ctx, args)
    }

    fn run(&mut self, func: u32, code: &[u8]) -> Result<Value> {
        let words = (code.len() / 4) as u32;
        let mut pc: u32 = 0;

        while pc < words {
            self.tick()?;
            let (op_byte, dst, s1, s2) = bytecode::unpack_instr(word_at(code, pc));
            pc += 1;
            let Some(op) = Opcode::from_u8(op_byte) else {
                return Err(Error::BadOpcode {
                    opcode: op_byte,
                    func,
                    pc: pc - 1,
                });
            };

            match op {
                // ── Control ──
                Opcode::Nop => {}
                Opcode::Trap => {
                    return Err(Error::Trap { func, pc: pc - 1 });
                }
                Opcode::Ret => return Ok(self.reg(0)),
                Opcode::Jmp => {
                    let rel = self.imm32(code, &mut pc, words, func, op)? as i32;
                    pc = pc.wrapping_add_signed(rel);
                }
                Opcode::Jz => {
                    let rel = self.imm32(code, &mut pc, words, func, op)? as i32;
                    if !self.reg(s1).is_truthy() {
                        pc = pc.wrapping_add_signed(rel);
                    }
                }
                Opcode::Jnz => {
                    let rel = self.imm32(code, &mut pc, words, func, op)? as i32;
                    if self.reg(s1).is_truthy() {
                        pc = pc.wrapping_add_signed(rel);
                    }
                }
                Opcode::Jlt => {
                    let rel = self.imm32(code, &mut pc, words, func, op)? as i32;
                    if self.reg(s1).as_i32() < self.reg(s2).as_i32() {
                        pc = pc.wrapping_add_signed(rel);
                    }
                }
                Opcode::Jle => {
                    let rel = self.imm32(code, &mut pc, words, func, op)? as i32;
                    if self.reg(s1).as_i32() <= self.reg(s2).as_i32() {
                        pc = pc.wrapping_add_signed(rel);
                    }
                }

                // ── Calls ──
                Opcode::Call => {
                    let target = self.imm32(code, &mut pc, words, func, op)?;
                    let (args, argc) = self.take_args();
                    let ret = self.exec(target, &args[..argc])?;
                    self.set_reg(dst, ret);
                }
                Opcode::CallHost => {
                    let import_index = self.imm32(code, &mut pc, words, func, op)?;
                    let (args, argc) = self.take_args();
                    let ret = self.call_host(import_index, &args[..argc])?;
                    self.set_reg(dst, ret);
                }
                Opcode::Arg => {
                    // dst is the staging slot, s1 the source register.
                    let slot = usize::from(dst);
                    if slot >= MAX_PARAMS {
                        self.diag(format!(
                            "arg slot {slot} out of range in function {func} at pc {}",
                            pc - 1
                        ));
                        return Err(Error::BadOpcode {
                            opcode: op_byte,
                            func,
                            pc: pc - 1,
                        });
                    }
                    self.arg_buf[slot] = self.reg(s1);
                    self.arg_count = self.arg_count.max(slot + 1);
                }

                // ── Load immediate / globals / move ──
                Opcode::Ldi32 => {
                    let imm = self.imm32(code, &mut pc, words, func, op)?;
                    self.set_reg(dst, Value::I32(imm as i32));
                }
                Opcode::Ldi64 => {
                    let imm = self.imm64(code, &mut pc, words, func, op)?;
                    self.set_reg(dst, Value::I64(imm as i64));
                }
                Opcode::Ldf32 => {
                    let imm = self.imm32(code, &mut pc, words, func, op)?;
                    self.set_reg(dst, Value::F32(f32::from_bits(imm)));
                }
                Opcode::Ldf64 => {
                    let imm = self.imm64(code, &mut pc, words, func, op)?;
                    self.set_reg(dst, Value::F64(f64::from_bits(imm)));
                }
                Opcode::LdTrue => self.set_reg(dst, Value::Bool(true)),
                Opcode::LdFalse => self.set_reg(dst, Value::Bool(false)),
                Opcode::LdGlobal => {
                    let index = self.imm32(code, &mut pc, words, func, op)?;
                    let Some(&value) = self.globals.get(index as usize) else {
                        return Err(self.global_range(index, func, pc));
                    };
                    self.set_reg(dst, value);
                }
                Opcode::StGlobal => {
                    let index = self.imm32(code, &mut pc, words, func, op)?;
                    let value = self.reg(s1);
                    let Some(slot) = self.globals.get_mut(index as usize) else {
                        return Err(self.global_range(index, func, pc));
                    };
                    *slot = value;
                }
                Opcode::Mov => {
                    let value = self.reg(s1);
                    self.set_reg(dst, value);
                }

                // ── i32 arithmetic ──
                Opcode::Add32 => self.bin_i32(dst, s1, s2, i32::wrapping_add),
                Opcode::Sub32 => self.bin_i32(dst, s1, s2, i32::wrapping_sub),
                Opcode::Mul32 => self.bin_i32(dst, s1, s2, i32::wrapping_mul),
                Opcode::Div32 => {
                    let (a, b) = self.pair_i32(s1, s2);
                    nonzero_divisor(b == 0, func, pc)?;
                    self.set_reg(dst, Value::I32(a.wrapping_div(b)));
                }
                Opcode::DivU32 => {
                    let (a, b) = self.pair_i32(s1, s2);
                    nonzero_divisor(b == 0, func, pc)?;
                    self.set_reg(dst, Value::I32(((a as u32) / (b as u32)) as i32));
                }
                Opcode::Rem32 => {
                    let (a, b) = self.pair_i32(s1, s2);
                    nonzero_divisor(b == 0, func, pc)?;
                    self.set_reg(dst, Value::I32(a.wrapping_rem(b)));
                }
                Opcode::RemU32 => {
                    let (a, b) = self.pair_i32(s1, s2);
                    nonzero_divisor(b == 0, func, pc)?;
                    self.set_reg(dst, Value::I32(((a as u32) % (b as u32)) as i32));
                }
                Opcode::Neg32 => self.un_i32(dst, s1, i32::wrapping_neg),
                Opcode::And32 => self.bin_i32(dst, s1, s2, |a, b| a & b),
                Opcode::Or32 => self.bin_i32(dst, s1, s2, |a, b| a | b),
                Opcode::Xor32 => self.bin_i32(dst, s1, s2, |a, b| a ^ b),
                Opcode::Shl32 => self.bin_i32(dst, s1, s2, |a, b| a.wrapping_shl(b as u32)),
                Opcode::Shr32 => self.bin_i32(dst, s1, s2, |a, b| a.wrapping_shr(b as u32)),
                Opcode::ShrU32 => {
                    self.bin_i32(dst, s1, s2, |a, b| ((a as u32).wrapping_shr(b as u32)) as i32);
                }
                Opcode::Not32 => self.un_i32(dst, s1, |a| !a),
                Opcode::Clz32 => self.un_i32(dst, s1, |a| a.leading_zeros() as i32),
                Opcode::Ctz32 => self.un_i32(dst, s1, |a| a.trailing_zeros() as i32),
                Opcode::Popcnt32 => self.un_i32(dst, s1, |a| a.count_ones() as i32),

                // ── i64 arithmetic ──
                Opcode::Add64 => self.bin_i64(dst, s1, s2, i64::wrapping_add),
                Opcode::Sub64 => self.bin_i64(dst, s1, s2, i64::wrapping_sub),
                Opcode::Mul64 => self.bin_i64(dst, s1, s2, i64::wrapping_mul),
                Opcode::Div64 => {
                    let (a, b) = self.pair_i64(s1, s2);
                    nonzero_divisor(b == 0, func, pc)?;
                    self.set_reg(dst, Value::I64(a.wrapping_div(b)));
                }
                Opcode::DivU64 => {
                    let (a, b) = self.pair_i64(s1, s2);
                    nonzero_divisor(b == 0, func, pc)?;
                    self.set_reg(dst, Value::I64(((a as u64) / (b as u64)) as i64));
                }
                Opcode::Rem64 => {
                    let (a, b) = self.pair_i64(s1, s2);
                    nonzero_divisor(b == 0, func, pc)?;
                    self.set_reg(dst, Value::I64(a.wrapping_rem(b)));
                }
                Opcode::RemU64 => {
                    let (a, b) = self.pair_i64(s1, s2);
                    nonzero_divisor(b == 0, func, pc)?;
                    self.set_reg(dst, Value::I64(((a as u64) % (b as u64)) as i64));
                }
                Opcode::Neg64 => self.un_i64(dst, s1, i64::wrapping_neg),
                Opcode::And64 => self.bin_i64(dst, s1, s2, |a, b| a & b),
                Opcode::Or64 => self.bin_i64(dst, s1, s2, |a, b| a | b),
                Opcode::Xor64 => self.bin_i64(dst, s1, s2, |a, b| a ^ b),
                Opcode::Shl64 => self.bin_i64(dst, s1, s2, |a, b| a.wrapping_shl(b as u32)),
                Opcode::Shr64 => self.bin_i64(dst, s1, s2, |a, b| a.wrapping_shr(b as u32)),
                Opcode::ShrU64 => {
                    self.bin_i64(dst, s1, s2, |a, b| ((a as u64).wrapping_shr(b as u32)) as i64);
                }
                Opcode::Not64 => self.un_i64(dst, s1, |a| !a),

                // ── f32 arithmetic ──
                Opcode::FAdd32 => self.bin_f32(dst, s1, s2, |a, b| a + b),
                Opcode::FSub32 => self.bin_f32(dst, s1, s2, |a, b| a - b),
                Opcode::FMul32 => self.bin_f32(dst, s1, s2, |a, b| a * b),
                // IEEE-754: float division by zero yields ±inf/NaN.
                Opcode::FDiv32 => self.bin_f32(dst, s1, s2, |a, b| a / b),
                Opcode::FAbs32 => self.un_f32(dst, s1, f32::abs),
                Opcode::FNeg32 => self.un_f32(dst, s1, |a| -a),
                Opcode::FSqrt32 => self.un_f32(dst, s1, f32::sqrt),
                Opcode::FMin32 => self.bin_f32(dst, s1, s2, f32::min),
                Opcode::FMax32 => self.bin_f32(dst, s1, s2, f32::max),
                Opcode::FFloor32 => self.un_f32(dst, s1, f32::floor),
                Opcode::FCeil32 => self.un_f32(dst, s1, f32::ceil),
                Opcode::FRound32 => self.un_f32(dst, s1, f32::round),

                // ── f64 arithmetic ──
                Opcode::FAdd64 => self.bin_f64(dst, s1, s2, |a, b| a + b),
                Opcode::FSub64 => self.bin_f64(dst, s1, s2, |a, b| a - b),
                Opcode::FMul64 => self.bin_f64(dst, s1, s2, |a, b| a * b),
                Opcode::FDiv64 => self.bin_f64(dst, s1, s2, |a, b| a / b),
                Opcode::FAbs64 => self.un_f64(dst, s1, f64::abs),
                Opcode::FNeg64 => self.un_f64(dst, s1, |a| -a),
                Opcode::FSqrt64 => self.un_f64(dst, s1, f64::sqrt),
                Opcode::FMin64 => self.bin_f64(dst, s1, s2, f64::min),
                Opcode::FMax64 => self.bin_f64(dst, s1, s2, f64::max),
                Opcode::FFloor64 => self.un_f64(dst, s1, f64::floor),
                Opcode::FCeil64 => self.un_f64(dst, s1, f64::ceil),
                Opcode::FRound64 => self.un_f64(dst, s1, f64::round),

                // ── Comparisons ──
                Opcode::Eq32 => self.cmp_i32(dst, s1, s2, |a, b| a == b),
                Opcode::Ne32 => self.cmp_i32(dst, s1, s2, |a, b| a != b),
                Opcode::Lt32 => self.cmp_i32(dst, s1, s2, |a, b| a < b),
                Opcode::Le32 => self.cmp_i32(dst, s1, s2, |a, b| a <= b),
                Opcode::Gt32 => self.cmp_i32(dst, s1, s2, |a, b| a > b),
                Opcode::Ge32 => self.cmp_i32(dst, s1, s2, |a, b| a >= b),
                Opcode::LtU32 => self.cmp_i32(dst, s1, s2, |a, b| (a as u32) < (b as u32)),
                Opcode::LeU32 => self.cmp_i32(dst, s1, s2, |a, b| (a as u32) <= (b as u32)),
                Opcode::Eq64 => self.cmp_i64(dst, s1, s2, |a, b| a == b),
                Opcode::Ne64 => self.cmp_i64(dst, s1, s2, |a, b| a != b),
                Opcode::Lt64 => self.cmp_i64(dst, s1, s2, |a, b| a < b),
                Opcode::Le64 => self.cmp_i64(dst, s1, s2, |a, b| a <= b),
                Opcode::Gt64 => self.cmp_i64(dst, s1, s2, |a, b| a > b),
                Opcode::Ge64 => self.cmp_i64(dst, s1, s2, |a, b| a >= b),
                Opcode::FEq32 => {
                    let v = self.reg(s1).as_f32() == self.reg(s2).as_f32();
                    self.set_reg(dst, Value::Bool(v));
                }
                Opcode::FLt32 => {
                    let v = self.reg(s1).as_f32() < self.reg(s2).as_f32();
                    self.set_reg(dst, Value::Bool(v));
                }
                Opcode::FEq64 => {
                    let v = self.reg(s1).as_f64() == self.reg(s2).as_f64();
                    self.set_reg(dst, Value::Bool(v));
                }
                Opcode::FLt64 => {
                    let v = self.reg(s1).as_f64() < self.reg(s2).as_f64();
                    self.set_reg(dst, Value::Bool(v));
                }

                // ── Conversions (float→int saturates) ──
                Opcode::I32ToI64 => {
                    let v = self.reg(s1).as_i32();
                    self.set_reg(dst, Value::I64(i64::from(v)));
                }
                Opcode::I64ToI32 => {
                    let v = self.reg(s1).as_i64();
                    self.set_reg(dst, Value::I32(v as i32));
                }
                Opcode::U32ToI64 => {
                    let v = self.reg(s1).as_i32() as u32;
                    self.set_reg(dst, Value::I64(i64::from(v)));
                }
                Opcode::I32ToF32 => {
                    let v = self.reg(s1).as_i32();
                    self.set_reg(dst, Value::F32(v as f32));
                }
                Opcode::I32ToF64 => {
                    let v = self.reg(s1).as_i32();
                    self.set_reg(dst, Value::F64(f64::from(v)));
                }
                Opcode::I64ToF32 => {
                    let v = self.reg(s1).as_i64();
                    self.set_reg(dst, Value::F32(v as f32));
                }
                Opcode::I64ToF64 => {
                    let v = self.reg(s1).as_i64();
                    self.set_reg(dst, Value::F64(v as f64));
                }
                Opcode::F32ToI32 => {
                    let v = self.reg(s1).as_f32();
                    self.set_reg(dst, Value::I32(v as i32));
                }
                Opcode::F64ToI32 => {
                    let v = self.reg(s1).as_f64();
                    self.set_reg(dst, Value::I32(v as i32));
                }
                Opcode::F32ToI64 => {
                    let v = self.reg(s1).as_f32();
                    self.set_reg(dst, Value::I64(v as i64));
                }
                Opcode::F64ToI64 => {
                    let v = self.reg(s1).as_f64();
                    self.set_reg(dst, Value::I64(v as i64));
                }
                Opcode::F32ToF64 => {
                    let v = self.reg(s1).as_f32();
                    self.set_reg(dst, Value::F64(f64::from(v)));
                }
                Opcode::F64ToF32 => {
                    let v = self.reg(s1).as_f64();
                    self.set_reg(dst, Value::F32(v as f32));
                }
                Opcode::BoolToI32 => {
                    let v = self.reg(s1).as_bool();
                    self.set_reg(dst, Value::I32(i32::from(v)));
                }

                // ── Memory loads ──
                Opcode::Load8 => {
                    let addr = self.eff_addr(s1, code, &mut pc, words, func, op)?;
                    let [b] = self.load_n::<1>(addr)?;
                    self.set_reg(dst, Value::I32(i32::from(b)));
                }
                Opcode::Load8S => {
                    let addr = self.eff_addr(s1, code, &mut pc, words, func, op)?;
                    let [b] = self.load_n::<1>(addr)?;
                    self.set_reg(dst, Value::I32(i32::from(b as i8)));
                }
                Opcode::Load16 => {
                    let addr = self.eff_addr(s1, code, &mut pc, words, func, op)?;
                    let b = self.load_n::<2>(addr)?;
                    self.set_reg(dst, Value::I32(i32::from(u16::from_le_bytes(b))));
                }
                Opcode::Load16S => {
                    let addr = self.eff_addr(s1, code, &mut pc, words, func, op)?;
                    let b = self.load_n::<2>(addr)?;
                    self.set_reg(dst, Value::I32(i32::from(i16::from_le_bytes(b))));
                }
                Opcode::Load32 => {
                    let addr = self.eff_addr(s1, code, &mut pc, words, func, op)?;
                    let b = self.load_n::<4>(addr)?;
                    self.set_reg(dst, Value::I32(i32::from_le_bytes(b)));
                }
                Opcode::Load64 => {
                    let addr = self.eff_addr(s1, code, &mut pc, words, func, op)?;
                    let b = self.load_n::<8>(addr)?;
                    self.set_reg(dst, Value::I64(i64::from_le_bytes(b)));
                }
                Opcode::LoadF32 => {
                    let addr = self.eff_addr(s1, code, &mut pc, words, func, op)?;
                    let b = self.load_n::<4>(addr)?;
                    self.set_reg(dst, Value::F32(f32::from_le_bytes(b)));
                }
                Opcode::LoadF64 => {
                    let addr = self.eff_addr(s1, code, &mut pc, words, func, op)?;
                    let b = self.load_n::<8>(addr)?;
                    self.set_reg(dst, Value::F64(f64::from_le_bytes(b)));
                }

                // ── Memory stores (value register is dst) ──
                Opcode::Store8 => {
                    let addr = self.eff_addr(s1, code, &mut pc, words, func, op)?;
                    let v = self.reg(dst).as_i32() as u8;
                    self.store_n(addr, [v])?;
                }
                Opcode::Store16 => {
                    let addr = self.eff_addr(s1, code, &mut pc, words, func, op)?;
                    let v = self.reg(dst).as_i32() as u16;
                    self.store_n(addr, v.to_le_bytes())?;
                }
                Opcode::Store32 => {
                    let addr = self.eff_addr(s1, code, &mut pc, words, func, op)?;
                    let v = self.reg(dst).as_i32();
                    self.store_n(addr, v.to_le_bytes())?;
                }
                Opcode::Store64 => {
                    let addr = self.eff_addr(s1, code, &mut pc, words, func, op)?;
                    let v = self.reg(dst).as_i64();
                    self.store_n(addr, v.to_le_bytes())?;
                }
                Opcode::StoreF32 => {
                    let addr = self.eff_addr(s1, code, &mut pc, words, func, op)?;
                    let v = self.reg(dst).as_f32();
                    self.store_n(addr, v.to_le_bytes())?;
                }
                Opcode::StoreF64 => {
                    let addr = self.eff_addr(s1, code, &mut pc, words, func, op)?;
                    let v = self.reg(dst).as_f64();
                    self.store_n(addr, v.to_le_bytes())?;
                }

                // ── Bulk memory ──
                Opcode::MemSize => {
                    let pages = self.memory.as_ref().map_or(0, |m| m.pages());
                    self.set_reg(dst, Value::I32(pages as i32));
                }
                Opcode::MemGrow => {
                    let delta = self.reg(s1).as_i32() as u32;
                    let result = match &mut self.memory {
                        Some(mem) => mem.grow(delta).map_or(-1, |prev| prev as i32),
                        None if delta == 0 => 0,
                        None => -1,
                    };
                    self.set_reg(dst, Value::I32(result));
                }
                Opcode::MemCopy => {
                    let to = self.reg(dst).as_i32() as u32;
                    let from = self.reg(s1).as_i32() as u32;
                    let len = self.reg(s2).as_i32() as u32;
                    match &mut self.memory {
                        Some(mem) => mem.copy_within(to, from, len)?,
                        None => return Err(Error::Bounds { offset: to, len }),
                    }
                }
                Opcode::MemFill => {
                    let to = self.reg(dst).as_i32() as u32;
                    let byte = self.reg(s1).as_i32() as u8;
                    let len = self.reg(s2).as_i32() as u32;
                    match &mut self.memory {
                        Some(mem) => mem.fill(to, byte, len)?,
                        None => return Err(Error::Bounds { offset: to, len }),
                    }
                }
            }
        }

        // Fell off the end: implicit return of R0.
        Ok(self.reg(0))
    }

    // ── Dispatch helpers ──

    fn tick(&mut self) -> Result<()> {
        self.fuel_used += 1;
        if self.config.fuel_limit > 0 && self.fuel_used > self.config.fuel_limit {
            return Err(Error::Fuel {
                used: self.fuel_used,
            });
        }
        Ok(())
    }

    fn reg(&self, index: u8) -> Value {
        self.stack.top().reg(index)
    }

    fn set_reg(&mut self, index: u8, value: Value) {
        self.stack.top_mut().set_reg(index, value);
    }

    /// Consume the staging buffer: returns its contents and clears it.
    fn take_args(&mut self) -> ([Value; MAX_PARAMS], usize) {
        let args = self.arg_buf;
        let argc = self.arg_count;
        self.arg_buf = [Value::Void; MAX_PARAMS];
        self.arg_count = 0;
        (args, argc)
    }

    fn imm32(
        &mut self,
        code: &[u8],
        pc: &mut u32,
        words: u32,
        func: u32,
        op: Opcode,
    ) -> Result<u32> {
        if *pc >= words {
            self.diag(format!(
                "truncated immediate in function {func} at pc {}",
                *pc
            ));
            return Err(Error::BadOpcode {
                opcode: op as u8,
                func,
                pc: *pc,
            });
        }
        let value = word_at(code, *pc);
        *pc += 1;
        Ok(value)
    }

    fn imm64(
        &mut self,
        code: &[u8],
        pc: &mut u32,
        words: u32,
        func: u32,
        op: Opcode,
    ) -> Result<u64> {
        let lo = self.imm32(code, pc, words, func, op)?;
        let hi = self.imm32(code, pc, words, func, op)?;
        Ok(u64::from(lo) | u64::from(hi) << 32)
    }

    /// Effective address of a memory access: base register plus the
    /// instruction's 32-bit displacement, wrapping like the hardware
    /// would. The bounds check happens at the access itself.
    fn eff_addr(
        &mut self,
        base: u8,
        code: &[u8],
        pc: &mut u32,
        words: u32,
        func: u32,
        op: Opcode,
    ) -> Result<u32> {
        let disp = self.imm32(code, pc, words, func, op)?;
        Ok((self.reg(base).as_i32() as u32).wrapping_add(disp))
    }

    fn load_n<const N: usize>(&self, addr: u32) -> Result<[u8; N]> {
        match &self.memory {
            Some(mem) => mem.load::<N>(addr),
            None => Err(Error::Bounds {
                offset: addr,
                len: N as u32,
            }),
        }
    }

    fn store_n<const N: usize>(&mut self, addr: u32, data: [u8; N]) -> Result<()> {
        match &mut self.memory {
            Some(mem) => mem.store(addr, data),
            None => Err(Error::Bounds {
                offset: addr,
                len: N as u32,
            }),
        }
    }

    fn pair_i32(&self, s1: u8, s2: u8) -> (i32, i32) {
        (self.reg(s1).as_i32(), self.reg(s2).as_i32())
    }

    fn pair_i64(&self, s1: u8, s2: u8) -> (i64, i64) {
        (self.reg(s1).as_i64(), self.reg(s2).as_i64())
    }

    fn bin_i32(&mut self, dst: u8, s1: u8, s2: u8, f: impl Fn(i32, i32) -> i32) {
        let (a, b) = self.pair_i32(s1, s2);
        self.set_reg(dst, Value::I32(f(a, b)));
    }

    fn un_i32(&mut self, dst: u8, s1: u8, f: impl Fn(i32) -> i32) {
        let a = self.reg(s1).as_i32();
        self.set_reg(dst, Value::I32(f(a)));
    }

    fn bin_i64(&mut self, dst: u8, s1: u8, s2: u8, f: impl Fn(i64, i64) -> i64) {
        let (a, b) = self.pair_i64(s1, s2);
        self.set_reg(dst, Value::I64(f(a, b)));
    }

    fn un_i64(&mut self, dst: u8, s1: u8, f: impl Fn(i64) -> i64) {
        let a = self.reg(s1).as_i64();
        self.set_reg(dst, Value::I64(f(a)));
    }

    fn bin_f32(&mut self, dst: u8, s1: u8, s2: u8, f: impl Fn(f32, f32) -> f32) {
        let (a, b) = (self.reg(s1).as_f32(), self.reg(s2).as_f32());
        self.set_reg(dst, Value::F32(f(a, b)));
    }

    fn un_f32(&mut self, dst: u8, s1: u8, f: impl Fn(f32) -> f32) {
        let a = self.reg(s1).as_f32();
        self.set_reg(dst, Value::F32(f(a)));
    }

    fn bin_f64(&mut self, dst: u8, s1: u8, s2: u8, f: impl Fn(f64, f64) -> f64) {
        let (a, b) = (self.reg(s1).as_f64(), self.reg(s2).as_f64());
        self.set_reg(dst, Value::F64(f(a, b)));
    }

    fn un_f64(&mut self, dst: u8, s1: u8, f: impl Fn(f64) -> f64) {
        let a = self.reg(s1).as_f64();
        self.set_reg(dst, Value::F64(f(a)));
    }

    fn cmp_i32(&mut self, dst: u8, s1: u8, s2: u8, f: impl Fn(i32, i32) -> bool) {
        let (a, b) = self.pair_i32(s1, s2);
        self.set_reg(dst, Value::Bool(f(a, b)));
    }

    fn cmp_i64(&mut self, dst: u8, s1: u8, s2: u8, f: impl Fn(i64, i64) -> bool) {
        let (a, b) = self.pair_i64(s1, s2);
        self.set_reg(dst, Value::Bool(f(a, b)));
    }

    fn global_range(&mut self, index: u32, func: u32, pc: u32) -> Error {
        self.diag(format!(
            "global index {index} out of range in function {func} at pc {pc}"
        ));
        Error::Bounds {
            offset: index,
            len: 0,
        }
    }
}

fn word_at(code: &[u8], pc: u32) -> u32 {
    let i = pc as usize * 4;
    u32::from_le_bytes([code[i], code[i + 1], code[i + 2], code[i + 3]])
}

/// `pc` points past the dividing instruction's word when this runs.
fn nonzero_divisor(is_zero: bool, func: u32, pc: u32) -> Result<()> {
    if is_zero {
        return Err(Error::DivZero { func, pc: pc - 1 });
    }
    Ok(())
}
