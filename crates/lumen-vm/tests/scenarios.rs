//! Black-box end-to-end scenarios against the public `Vm::interpret` entry
//! point, one per case spec.md §8 enumerates, plus its error-path twins.

use std::cell::RefCell;
use std::rc::Rc;

use indoc::indoc;
use pretty_assertions::assert_eq;

use lumen_vm::{InterpretResult, Vm, VmIo};

#[derive(Default)]
struct CapturingIo {
    prints: Rc<RefCell<Vec<String>>>,
    errors: Rc<RefCell<Vec<String>>>,
}

impl VmIo for CapturingIo {
    fn print(&mut self, line: &str) {
        self.prints.borrow_mut().push(line.to_string());
    }

    fn eprint(&mut self, message: &str) {
        self.errors.borrow_mut().push(message.to_string());
    }
}

fn run(source: &str) -> (InterpretResult, Vec<String>, Vec<String>) {
    let prints: Rc<RefCell<Vec<String>>> = Rc::default();
    let errors: Rc<RefCell<Vec<String>>> = Rc::default();
    let io = CapturingIo { prints: prints.clone(), errors: errors.clone() };
    let mut vm = Vm::with_io(Box::new(io));
    let result = vm.interpret(source);
    (result, prints.borrow().clone(), errors.borrow().clone())
}

#[test]
fn scenario_arithmetic_precedence() {
    let (result, prints, _) = run("print 1 + 2 * 3;");
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(prints, vec!["7"]);
}

#[test]
fn scenario_string_concatenation() {
    let (result, prints, _) = run(indoc! {r#"
        var a = "foo";
        var b = "bar";
        print a + b;
    "#});
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(prints, vec!["foobar"]);
}

#[test]
fn scenario_for_loop_accumulation() {
    let (result, prints, _) = run(indoc! {"
        var x = 0;
        for (var i = 0; i < 3; i = i + 1) {
            x = x + i;
        }
        print x;
    "});
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(prints, vec!["3"]);
}

#[test]
fn scenario_closure_state_persists_across_calls() {
    let (result, prints, _) = run(indoc! {"
        fun make() {
            var c = 0;
            fun inc() {
                c = c + 1;
                return c;
            }
            return inc;
        }
        var f = make();
        print f();
        print f();
        print f();
    "});
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(prints, vec!["1", "2", "3"]);
}

#[test]
fn scenario_if_else_takes_the_true_branch() {
    let (result, prints, _) = run(indoc! {r#"
        if (!(1 == 2)) print "ok"; else print "no";
    "#});
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(prints, vec!["ok"]);
}

#[test]
fn scenario_uninitialized_var_is_nil() {
    let (result, prints, _) = run("var a; print a;");
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(prints, vec!["nil"]);
}

#[test]
fn scenario_independent_closures_keep_separate_state() {
    let (result, prints, _) = run(indoc! {"
        fun make() {
            var c = 0;
            fun inc() { c = c + 1; return c; }
            return inc;
        }
        var f = make();
        var g = make();
        print f();
        print g();
        print f();
    "});
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(prints, vec!["1", "1", "2"]);
}

#[test]
fn error_scenario_adding_number_and_string() {
    let (result, _, errors) = run(r#"print 1 + "a";"#);
    assert_eq!(result, InterpretResult::RuntimeError);
    assert!(errors[0].contains("Operands must be two numbers or two strings"));
}

#[test]
fn error_scenario_undefined_global_read() {
    let (result, _, errors) = run("print foo;");
    assert_eq!(result, InterpretResult::RuntimeError);
    assert!(errors[0].contains("Undefined variable 'foo'"));
}

#[test]
fn error_scenario_call_stack_trace_names_every_frame() {
    let (result, _, errors) = run(indoc! {r#"
        fun inner() { return 1 + "a"; }
        fun outer() { return inner(); }
        outer();
    "#});
    assert_eq!(result, InterpretResult::RuntimeError);
    assert!(errors[0].contains("in inner()"));
    assert!(errors[0].contains("in outer()"));
}

#[test]
fn error_scenario_deep_recursion_overflows_the_frame_stack() {
    let (result, _, errors) = run(indoc! {"
        fun recurse(n) { return recurse(n + 1); }
        recurse(0);
    "});
    assert_eq!(result, InterpretResult::RuntimeError);
    assert!(errors[0].contains("Stack overflow"));
}
