// Integration tests driving the compiler and VM end to end through the
// public `interpret` API, asserting on captured `print` output.

use lumen::Vm;
use std::cell::RefCell;
use std::rc::Rc;

fn run(source: &str) -> String {
    let mut vm = Vm::new();
    let sink = Rc::new(RefCell::new(Vec::new()));
    vm.set_output(sink.clone());
    vm.interpret(source).unwrap_or_else(|errors| {
        panic!("program failed to run: {:?}", errors.iter().map(|e| e.message.clone()).collect::<Vec<_>>())
    });
    String::from_utf8(sink.borrow().clone()).unwrap()
}

fn run_lines(source: &str) -> Vec<String> {
    run(source).lines().map(str::to_string).collect()
}

#[test]
fn arithmetic_and_precedence() {
    let out = run_lines(
        r#"
        print 1 + 2 * 3;
        print (1 + 2) * 3;
        print -2 * -3;
        "#,
    );
    assert_eq!(out, vec!["7", "9", "6"]);
}

#[test]
fn strings_and_truthiness() {
    let out = run_lines(
        r#"
        print "foo" + "bar";
        print !nil;
        print !0;
        print "a" == "a";
        "#,
    );
    assert_eq!(out, vec!["foobar", "true", "false", "true"]);
}

#[test]
fn closures_capture_a_shared_upvalue() {
    let out = run_lines(
        r#"
        fun make() { var c = 0; fun inc() { c = c + 1; return c; } return inc; }
        var f = make();
        print f();
        print f();
        print f();
        "#,
    );
    assert_eq!(out, vec!["1", "2", "3"]);
}

#[test]
fn inheritance_and_bound_super_calls() {
    let out = run_lines(
        r#"
        class A { greet() { return "A"; } }
        class B < A { greet() { return "B+" + super.greet(); } }
        var b = B();
        print b.greet();
        "#,
    );
    assert_eq!(out, vec!["B+A"]);
}

#[test]
fn once_runs_a_single_time_across_calls() {
    let out = run_lines(
        r#"
        fun f(x) { once { print "first"; } if (x) print "yes"; else print "no"; }
        f(true);
        f(false);
        f(true);
        "#,
    );
    assert_eq!(out, vec!["first", "yes", "no", "yes"]);
}

#[test]
fn for_loop_break_and_continue() {
    let out = run_lines(
        r#"
        for (var i = 0; i < 5; i = i + 1) {
            if (i == 1) continue;
            if (i == 4) break;
            print i;
        }
        "#,
    );
    assert_eq!(out, vec!["0", "2", "3"]);
}

#[test]
fn const_assignment_is_a_compile_error() {
    let mut vm = Vm::new();
    let errors = vm.interpret("const x = 1; x = 2;").expect_err("assigning to a const should fail to compile");
    assert!(errors.iter().any(|e| e.message.contains("const")));
}

#[test]
fn reading_a_local_in_its_own_initializer_is_a_compile_error() {
    let mut vm = Vm::new();
    let errors = vm.interpret("{ var x = x; }").expect_err("self-referential initializer should fail to compile");
    assert!(errors.iter().any(|e| e.message.contains("own initializer")));
}

#[test]
fn globals_persist_across_successive_interpret_calls() {
    let mut vm = Vm::new();
    vm.interpret("var counter = 0;").expect("first call should succeed");
    let sink = Rc::new(RefCell::new(Vec::new()));
    vm.set_output(sink.clone());
    vm.interpret("counter = counter + 1; print counter;").expect("second call should succeed");
    vm.interpret("counter = counter + 1; print counter;").expect("third call should succeed");
    let out: Vec<String> = String::from_utf8(sink.borrow().clone()).unwrap().lines().map(str::to_string).collect();
    assert_eq!(out, vec!["1", "2"]);
}

#[test]
fn calling_undefined_function_raises_runtime_error_with_trace() {
    let mut vm = Vm::new();
    let errors = vm.interpret("fun outer() { inner(); } outer();").expect_err("undefined callee should fail at runtime");
    let err = &errors[0];
    assert_eq!(err.kind, lumen::ErrorKind::Runtime);
    assert!(!err.trace.is_empty());
}

#[test]
fn native_hasfield_setfield_deletefield_round_trip() {
    let out = run_lines(
        r#"
        class Point { }
        var p = Point();
        print hasfield(p, "x");
        setfield(p, "x", 10);
        print hasfield(p, "x");
        print p.x;
        deletefield(p, "x");
        print hasfield(p, "x");
        "#,
    );
    assert_eq!(out, vec!["false", "true", "10", "false"]);
}
