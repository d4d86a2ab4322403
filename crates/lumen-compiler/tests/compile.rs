//! Black-box tests against the public `compile` entry point: bytecode shape
//! and diagnostics, not internal compiler state.

use indoc::indoc;
use pretty_assertions::assert_eq;

use lumen_core::{Heap, OpCode, Table};

fn compile(source: &str) -> Result<std::rc::Rc<lumen_core::LFunction>, Vec<String>> {
    let mut heap = Heap::new();
    let mut strings = Table::new();
    lumen_compiler::compile(source, &mut heap, &mut strings)
}

#[test]
fn closure_over_a_loop_counter_emits_get_and_set_upvalue() {
    let source = indoc! {"
        fun make() {
            var c = 0;
            fun inc() {
                c = c + 1;
                return c;
            }
            return inc;
        }
    "};
    let function = compile(source).expect("well-formed closures compile");
    let code = function.chunk.code();
    assert!(code.contains(&OpCode::MakeClosure.as_u8()));

    let constant = function
        .chunk
        .constants()
        .iter()
        .find_map(|v| match v {
            lumen_core::Value::Obj(lumen_core::Obj::Function(f)) => Some(f.clone()),
            _ => None,
        })
        .expect("make() embeds inc() as a constant function");
    let inner_code = constant.chunk.code();
    assert!(inner_code.contains(&OpCode::GetUpvalue.as_u8()));
    assert!(inner_code.contains(&OpCode::SetUpvalue.as_u8()));
}

#[test]
fn for_loop_desugars_without_referencing_globals() {
    let source = indoc! {"
        var x = 0;
        for (var i = 0; i < 3; i = i + 1) {
            x = x + i;
        }
        print x;
    "};
    let function = compile(source).expect("for loops compile");
    let code = function.chunk.code();
    assert!(code.contains(&OpCode::Loop.as_u8()));
    assert!(code.contains(&OpCode::JumpIfFalse.as_u8()));
}

#[test]
fn multiple_errors_are_all_reported_in_one_pass() {
    let source = indoc! {"
        1 = 2;
        { var a = a; }
    "};
    let errors = compile(source).expect_err("both statements are compile errors");
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().any(|e| e.contains("Invalid assignment target")));
    assert!(errors.iter().any(|e| e.contains("own initializer")));
}

#[test]
fn error_messages_carry_line_and_location() {
    let errors = compile("\n\nfoo +;\n").expect_err("dangling operator is a compile error");
    assert!(errors[0].starts_with("[line 3] Error"));
}
