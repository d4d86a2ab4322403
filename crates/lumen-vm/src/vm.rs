//! La machine virtuelle : dispatch loop, pile de valeurs, pile de frames,
//! capture et fermeture des upvalues.
//!
//! `Vm::interpret` est l'unique point d'entrée public : il compile la source
//! via [`lumen_compiler::compile`], enveloppe la fonction top-level dans une
//! fermeture, pousse la frame racine, puis dispatche jusqu'à ce que cette
//! frame retourne (ou qu'une erreur runtime survienne).

use std::cell::RefCell;
use std::rc::Rc;

use lumen_core::{intern_string, Closure, Heap, LString, Native, NativeFn, Obj, OpCode, Table, Upvalue, Value};
use thiserror::Error;

use crate::frame::CallFrame;

/// Profondeur maximale d'appels imbriqués (spec.md §3, "FRAMES_MAX = 64").
const FRAMES_MAX: usize = 64;

/// Résultat global d'une compilation + exécution (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    /// Tout s'est bien passé.
    Ok,
    /// Erreur de compilation : l'exécution n'a pas démarré.
    CompileError,
    /// Erreur d'exécution : voir le sink d'erreurs pour les diagnostics.
    RuntimeError,
}

/// Catégories d'erreur d'exécution (spec.md §7), avec les libellés exacts du
/// modèle de référence.
#[derive(Debug, Error, PartialEq)]
pub enum VmError {
    /// Opérande non numérique pour une comparaison ou un binop arithmétique.
    #[error("Operands must be numbers.")]
    OperandsMustBeNumbers,
    /// `+` exige deux nombres ou deux chaînes.
    #[error("Operands must be two numbers or two strings.")]
    OperandsMustBeNumbersOrStrings,
    /// `-` unaire exige un nombre.
    #[error("Operand must be a number.")]
    OperandMustBeNumber,
    /// `!` exige un booléen — plus strict que la simple "fausseté" (spec.md §9).
    #[error("Operand must be a boolean.")]
    OperandMustBeBoolean,
    /// Lecture ou écriture d'une globale jamais définie.
    #[error("Undefined variable '{0}'.")]
    UndefinedVariable(String),
    /// Le nombre d'arguments fournis ne correspond pas à l'arité déclarée.
    #[error("Expected {expected} arguments but got {got}.")]
    ArityMismatch {
        /// Arité déclarée par la fonction.
        expected: u8,
        /// Arguments effectivement fournis par l'appelant.
        got: u8,
    },
    /// Plus de `FRAMES_MAX` appels imbriqués.
    #[error("Stack overflow.")]
    StackOverflow,
    /// La valeur appelée n'est ni une fermeture ni une fonction native.
    #[error("Can only call functions and classes.")]
    NotCallable,
}

/// Où vont la sortie `print` et les diagnostics d'erreur runtime.
///
/// La VM ne choisit jamais stdout/stderr elle-même — dans l'esprit du trait
/// `Host` du crate enseignant — afin que les tests puissent capturer la
/// sortie sans passer par de vrais flux.
pub trait VmIo {
    /// Une ligne produite par une instruction `PRINT`.
    fn print(&mut self, line: &str);
    /// Un message d'erreur runtime déjà formaté, trace d'appel incluse.
    fn eprint(&mut self, message: &str);
}

/// Sortie par défaut : stdout/stderr du process.
#[derive(Default)]
pub struct StdIo;

impl VmIo for StdIo {
    fn print(&mut self, line: &str) {
        println!("{line}");
    }

    fn eprint(&mut self, message: &str) {
        eprintln!("{message}");
    }
}

/// La machine virtuelle Lumen : un process-wide state fait explicite plutôt
/// que global (spec.md §9, "Global singleton VM").
pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    heap: Heap,
    strings: Table,
    globals: Table,
    open_upvalues: Vec<Rc<RefCell<Upvalue>>>,
    io: Box<dyn VmIo>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// VM fraîche : tas et globales vides, sortie sur stdout/stderr.
    pub fn new() -> Self {
        Self::with_io(Box::new(StdIo))
    }

    /// VM avec un puits de sortie personnalisé.
    pub fn with_io(io: Box<dyn VmIo>) -> Self {
        Self {
            stack: Vec::with_capacity(FRAMES_MAX * 256),
            frames: Vec::with_capacity(FRAMES_MAX),
            heap: Heap::new(),
            strings: Table::new(),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            io,
        }
    }

    /// Installe une fonction native globalement visible (spec.md §6).
    ///
    /// La VM elle-même n'enregistre jamais `clock` : spec.md §1 en fait la
    /// responsabilité d'un pilote externe (le CLI).
    pub fn register_native(&mut self, name: &str, function: NativeFn) {
        let name_str = intern_string(&mut self.heap, &mut self.strings, name.as_bytes());
        let native = Rc::new(Native { name: name_str.clone(), function });
        self.heap.track(Obj::Native(native.clone()));
        self.globals.set(name_str, Value::Obj(Obj::Native(native)));
    }

    /// Compile `source` puis l'exécute jusqu'à ce que la frame racine retourne.
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let function = match lumen_compiler::compile(source, &mut self.heap, &mut self.strings) {
            Ok(function) => function,
            Err(errors) => {
                for error in &errors {
                    self.io.eprint(error);
                }
                return InterpretResult::CompileError;
            }
        };

        let closure = Rc::new(Closure::new(function));
        self.heap.track(Obj::Closure(closure.clone()));
        self.stack.push(Value::Obj(Obj::Closure(closure.clone())));
        self.frames.push(CallFrame::new(closure, 0));

        match self.run() {
            Ok(()) => InterpretResult::Ok,
            Err(err) => {
                let mut message = err.to_string();
                for frame in self.frames.iter().rev() {
                    message.push('\n');
                    message.push_str(&format!("[line {}] in {}", frame.current_line(), frame.display_name()));
                }
                self.io.eprint(&message);
                self.reset_stacks();
                InterpretResult::RuntimeError
            }
        }
    }

    /// Vide pile de valeurs, pile de frames et liste d'upvalues ouvertes
    /// après une erreur runtime, laissant le tas intact (spec.md §7).
    fn reset_stacks(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("dispatch loop never pops below what the compiler pushed")
    }

    fn peek(&self, distance: usize) -> &Value {
        let index = self.stack.len() - 1 - distance;
        &self.stack[index]
    }

    /// Boucle de dispatch. Retourne quand la frame racine exécute `RETURN`.
    fn run(&mut self) -> Result<(), VmError> {
        loop {
            let frame_idx = self.frames.len() - 1;

            #[cfg(feature = "tracing")]
            self.trace_instruction(frame_idx);

            let instruction = self.frames[frame_idx].read_byte();
            let op = OpCode::from_u8(instruction)
                .expect("chunk bytes are only ever written by the compiler as valid opcodes");

            match op {
                OpCode::Constant => {
                    let value = self.frames[frame_idx].read_constant();
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string(frame_idx);
                    let value = self.peek(0).clone();
                    self.globals.set(name, value);
                    self.pop();
                }
                OpCode::GetGlobal => {
                    let name = self.read_string(frame_idx);
                    match self.globals.get(&name) {
                        Some(value) => self.push(value),
                        None => return Err(VmError::UndefinedVariable(name.as_str_lossy().into_owned())),
                    }
                }
                OpCode::SetGlobal => {
                    let name = self.read_string(frame_idx);
                    let value = self.peek(0).clone();
                    if self.globals.set(name.clone(), value) {
                        // The key was absent: undo the insertion before reporting.
                        self.globals.delete(&name);
                        return Err(VmError::UndefinedVariable(name.as_str_lossy().into_owned()));
                    }
                }
                OpCode::GetLocal => {
                    let slot = self.frames[frame_idx].read_byte() as usize;
                    let base = self.frames[frame_idx].slot_base;
                    self.push(self.stack[base + slot].clone());
                }
                OpCode::SetLocal => {
                    let slot = self.frames[frame_idx].read_byte() as usize;
                    let base = self.frames[frame_idx].slot_base;
                    self.stack[base + slot] = self.peek(0).clone();
                }
                OpCode::GetUpvalue => {
                    let slot = self.frames[frame_idx].read_byte() as usize;
                    let value = self.read_upvalue(frame_idx, slot);
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.frames[frame_idx].read_byte() as usize;
                    let value = self.peek(0).clone();
                    self.write_upvalue(frame_idx, slot, value);
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => self.binary_compare(|a, b| a > b)?,
                OpCode::Less => self.binary_compare(|a, b| a < b)?,
                OpCode::Add => self.add()?,
                OpCode::Subtract => self.binary_number(|a, b| a - b)?,
                OpCode::Multiply => self.binary_number(|a, b| a * b)?,
                OpCode::Divide => self.binary_number(|a, b| a / b)?,
                OpCode::Not => {
                    let value = self.peek(0).as_bool().ok_or(VmError::OperandMustBeBoolean)?;
                    self.pop();
                    self.push(Value::Bool(!value));
                }
                OpCode::Negate => {
                    let value = self.peek(0).as_number().ok_or(VmError::OperandMustBeNumber)?;
                    self.pop();
                    self.push(Value::Number(-value));
                }
                OpCode::Print => {
                    let value = self.pop();
                    let line = value.to_string();
                    self.io.print(&line);
                }
                OpCode::Jump => {
                    let offset = self.frames[frame_idx].read_u16();
                    self.frames[frame_idx].ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.frames[frame_idx].read_u16();
                    if self.peek(0).is_falsey() {
                        self.frames[frame_idx].ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.frames[frame_idx].read_u16();
                    self.frames[frame_idx].ip -= offset as usize;
                }
                OpCode::Call => {
                    let arg_count = self.frames[frame_idx].read_byte();
                    self.call_value(arg_count)?;
                }
                OpCode::MakeClosure => self.make_closure(frame_idx),
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("a frame is always active while the loop runs");
                    self.close_upvalues(frame.slot_base);
                    if self.frames.is_empty() {
                        self.stack.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.slot_base);
                    self.push(result);
                }
            }
        }
    }

    fn read_string(&mut self, frame_idx: usize) -> Rc<LString> {
        match self.frames[frame_idx].read_constant() {
            Value::Obj(Obj::String(s)) => s,
            other => unreachable!("compiler only ever emits interned strings for name operands, got {other}"),
        }
    }

    fn binary_number(&mut self, op: impl Fn(f64, f64) -> f64) -> Result<(), VmError> {
        let b = self.peek(0).as_number().ok_or(VmError::OperandsMustBeNumbers)?;
        let a = self.peek(1).as_number().ok_or(VmError::OperandsMustBeNumbers)?;
        self.pop();
        self.pop();
        self.push(Value::Number(op(a, b)));
        Ok(())
    }

    fn binary_compare(&mut self, op: impl Fn(f64, f64) -> bool) -> Result<(), VmError> {
        let b = self.peek(0).as_number().ok_or(VmError::OperandsMustBeNumbers)?;
        let a = self.peek(1).as_number().ok_or(VmError::OperandsMustBeNumbers)?;
        self.pop();
        self.pop();
        self.push(Value::Bool(op(a, b)));
        Ok(())
    }

    fn add(&mut self) -> Result<(), VmError> {
        match (self.peek(1).clone(), self.peek(0).clone()) {
            (Value::Number(a), Value::Number(b)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(a + b));
            }
            (Value::Obj(Obj::String(a)), Value::Obj(Obj::String(b))) => {
                self.pop();
                self.pop();
                let mut bytes = Vec::with_capacity(a.len() + b.len());
                bytes.extend_from_slice(a.as_bytes());
                bytes.extend_from_slice(b.as_bytes());
                let interned = intern_string(&mut self.heap, &mut self.strings, &bytes);
                self.push(Value::Obj(Obj::String(interned)));
            }
            _ => return Err(VmError::OperandsMustBeNumbersOrStrings),
        }
        Ok(())
    }

    fn call_value(&mut self, arg_count: u8) -> Result<(), VmError> {
        let callee = self.peek(arg_count as usize).clone();
        match callee {
            Value::Obj(Obj::Closure(closure)) => self.call_closure(closure, arg_count),
            Value::Obj(Obj::Native(native)) => {
                let args_start = self.stack.len() - arg_count as usize;
                let result = (native.function)(&self.stack[args_start..]);
                self.stack.truncate(args_start - 1);
                self.push(result);
                Ok(())
            }
            _ => Err(VmError::NotCallable),
        }
    }

    fn call_closure(&mut self, closure: Rc<Closure>, arg_count: u8) -> Result<(), VmError> {
        let arity = closure.function.arity;
        if arg_count != arity {
            return Err(VmError::ArityMismatch { expected: arity, got: arg_count });
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(VmError::StackOverflow);
        }
        let slot_base = self.stack.len() - arg_count as usize - 1;
        self.frames.push(CallFrame::new(closure, slot_base));
        Ok(())
    }

    fn make_closure(&mut self, frame_idx: usize) {
        let function = match self.frames[frame_idx].read_constant() {
            Value::Obj(Obj::Function(f)) => f,
            other => unreachable!("MAKE_CLOSURE always points at a Function constant, got {other}"),
        };
        let upvalue_count = function.upvalue_count;
        let mut closure = Closure::new(function);
        let base = self.frames[frame_idx].slot_base;
        for _ in 0..upvalue_count {
            let is_local = self.frames[frame_idx].read_byte() != 0;
            let index = self.frames[frame_idx].read_byte() as usize;
            let upvalue = if is_local {
                self.capture_upvalue(base + index)
            } else {
                self.frames[frame_idx].closure.upvalues[index].clone()
            };
            closure.upvalues.push(upvalue);
        }
        let closure = Rc::new(closure);
        self.heap.track(Obj::Closure(closure.clone()));
        self.push(Value::Obj(Obj::Closure(closure)));
    }

    fn read_upvalue(&self, frame_idx: usize, slot: usize) -> Value {
        let upvalue = self.frames[frame_idx].closure.upvalues[slot].borrow();
        match &*upvalue {
            Upvalue::Open(stack_slot) => self.stack[*stack_slot].clone(),
            Upvalue::Closed(value) => value.clone(),
        }
    }

    fn write_upvalue(&mut self, frame_idx: usize, slot: usize, value: Value) {
        let upvalue = self.frames[frame_idx].closure.upvalues[slot].clone();
        let open_slot = upvalue.borrow().open_slot();
        match open_slot {
            Some(stack_slot) => self.stack[stack_slot] = value,
            None => *upvalue.borrow_mut() = Upvalue::Closed(value),
        }
    }

    /// Retrouve ou crée l'upvalue ouverte référençant `slot`, en maintenant
    /// la liste triée par adresse de pile décroissante (spec.md §4.6).
    fn capture_upvalue(&mut self, slot: usize) -> Rc<RefCell<Upvalue>> {
        let slot_of = |uv: &Rc<RefCell<Upvalue>>| -> usize {
            uv.borrow().open_slot().expect("open_upvalues only ever holds upvalues that are still open")
        };
        if let Some(found) = self.open_upvalues.iter().find(|uv| slot_of(uv) == slot) {
            return found.clone();
        }
        let insert_at =
            self.open_upvalues.iter().position(|uv| slot_of(uv) < slot).unwrap_or(self.open_upvalues.len());
        let created = Rc::new(RefCell::new(Upvalue::Open(slot)));
        self.open_upvalues.insert(insert_at, created.clone());
        created
    }

    /// Ferme toute upvalue ouverte dont le slot est `>= from_slot`, copiant
    /// la valeur de pile dans sa cellule propre (spec.md §4.6).
    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(upvalue) = self.open_upvalues.first() {
            let slot = match upvalue.borrow().open_slot() {
                Some(slot) if slot >= from_slot => slot,
                _ => break,
            };
            let value = self.stack[slot].clone();
            *upvalue.borrow_mut() = Upvalue::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    #[cfg(feature = "tracing")]
    fn trace_instruction(&self, frame_idx: usize) {
        let frame = &self.frames[frame_idx];
        let byte = frame.closure.function.chunk.read_byte(frame.ip);
        tracing::trace!(function = %frame.display_name(), offset = frame.ip, opcode = byte, "dispatch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc as StdRc;

    #[derive(Default)]
    struct CapturingIo {
        prints: StdRc<StdRefCell<Vec<String>>>,
        errors: StdRc<StdRefCell<Vec<String>>>,
    }

    impl VmIo for CapturingIo {
        fn print(&mut self, line: &str) {
            self.prints.borrow_mut().push(line.to_string());
        }

        fn eprint(&mut self, message: &str) {
            self.errors.borrow_mut().push(message.to_string());
        }
    }

    fn run_capturing(source: &str) -> (InterpretResult, Vec<String>, Vec<String>) {
        let prints: StdRc<StdRefCell<Vec<String>>> = StdRc::default();
        let errors: StdRc<StdRefCell<Vec<String>>> = StdRc::default();
        let io = CapturingIo { prints: prints.clone(), errors: errors.clone() };
        let mut vm = Vm::with_io(Box::new(io));
        let result = vm.interpret(source);
        (result, prints.borrow().clone(), errors.borrow().clone())
    }

    #[test]
    fn arithmetic_precedence() {
        let (result, prints, _) = run_capturing("print 1 + 2 * 3;");
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(prints, vec!["7"]);
    }

    #[test]
    fn string_concatenation() {
        let (result, prints, _) = run_capturing(r#"var a = "foo"; var b = "bar"; print a + b;"#);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(prints, vec!["foobar"]);
    }

    #[test]
    fn for_loop_accumulates() {
        let source = "var x = 0; for (var i = 0; i < 3; i = i + 1) { x = x + i; } print x;";
        let (result, prints, _) = run_capturing(source);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(prints, vec!["3"]);
    }

    #[test]
    fn closures_capture_and_persist_state_across_calls() {
        let source = "fun make() { var c = 0; fun inc() { c = c + 1; return c; } return inc; } \
                       var f = make(); print f(); print f(); print f();";
        let (result, prints, _) = run_capturing(source);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(prints, vec!["1", "2", "3"]);
    }

    #[test]
    fn uninitialized_var_defaults_to_nil() {
        let (result, prints, _) = run_capturing("var a; print a;");
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(prints, vec!["nil"]);
    }

    #[test]
    fn short_circuit_and_skips_right_operand() {
        let (result, prints, _) = run_capturing(r#"false and print "never"; print "after";"#);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(prints, vec!["after"]);
    }

    #[test]
    fn short_circuit_or_skips_right_operand() {
        let (result, prints, _) = run_capturing(r#"true or print "never"; print "after";"#);
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(prints, vec!["after"]);
    }

    #[test]
    fn type_error_on_mixed_add_is_a_runtime_error() {
        let (result, _, errors) = run_capturing(r#"print 1 + "a";"#);
        assert_eq!(result, InterpretResult::RuntimeError);
        assert!(errors[0].contains("Operands must be two numbers or two strings"));
    }

    #[test]
    fn undefined_global_read_is_a_runtime_error() {
        let (result, _, errors) = run_capturing("print foo;");
        assert_eq!(result, InterpretResult::RuntimeError);
        assert!(errors[0].contains("Undefined variable 'foo'"));
    }

    #[test]
    fn stack_and_frames_are_empty_after_a_well_formed_program_returns() {
        let mut vm = Vm::new();
        let result = vm.interpret("var a = 1; print a;");
        assert_eq!(result, InterpretResult::Ok);
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
    }

    #[test]
    fn runtime_error_resets_stacks_but_keeps_the_vm_usable() {
        let mut vm = Vm::new();
        assert_eq!(vm.interpret("print 1 + \"a\";"), InterpretResult::RuntimeError);
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
        assert_eq!(vm.interpret("print 1;"), InterpretResult::Ok);
    }

    #[test]
    fn native_functions_are_callable_after_registration() {
        let mut vm = Vm::new();
        vm.register_native("clock", crate::clock_native);
        assert_eq!(vm.interpret("print clock() >= 0;"), InterpretResult::Ok);
    }

    #[test]
    fn calling_a_non_function_is_a_runtime_error() {
        let (result, _, errors) = run_capturing("var a = 1; a();");
        assert_eq!(result, InterpretResult::RuntimeError);
        assert!(errors[0].contains("Can only call functions and classes"));
    }

    #[test]
    fn arity_mismatch_is_a_runtime_error() {
        let (result, _, errors) = run_capturing("fun f(a, b) { return a + b; } f(1);");
        assert_eq!(result, InterpretResult::RuntimeError);
        assert!(errors[0].contains("Expected 2 arguments but got 1"));
    }
}
