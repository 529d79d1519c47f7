//! End-to-end execution tests: every program runs through both the
//! bytecode interpreter and the native compiler, and the tight-heap cases
//! force frequent collection.

use mitscript_engine::{compile_source, Error, ExecMode, Vm, VmOptions};

fn run_with(src: &str, mode: ExecMode, mem_mb: usize) -> Result<String, Error> {
    let mut vm = Vm::new_captured(VmOptions {
        max_heap_mb: mem_mb,
        mode,
    });
    let main = compile_source(&mut vm, src)?;
    vm.run(main)?;
    Ok(String::from_utf8(vm.captured_output().unwrap().to_vec()).unwrap())
}

/// Assert identical output from both execution paths.
fn check(src: &str, expected: &str) {
    for mode in [ExecMode::Interpret, ExecMode::Compile] {
        let out = run_with(src, mode, 1000).unwrap_or_else(|e| panic!("{mode:?}: {e}"));
        assert_eq!(out, expected, "mode {mode:?}");
    }
}

/// Same, under a one-megabyte heap.
fn check_tight_heap(src: &str, expected: &str) {
    for mode in [ExecMode::Interpret, ExecMode::Compile] {
        let out = run_with(src, mode, 1).unwrap_or_else(|e| panic!("{mode:?}: {e}"));
        assert_eq!(out, expected, "mode {mode:?} with 1MB heap");
    }
}

#[test]
fn test_print_addition() {
    check("print(1 + 2);", "3\n");
}

#[test]
fn test_string_add_is_polymorphic() {
    check("x = \"a\"; x = x + 1; print(x);", "a1\n");
    check("print(1 + \"a\");", "1a\n");
    check("print(true + \" and \" + false);", "true and false\n");
}

#[test]
fn test_global_counter_shared_with_function() {
    check(
        "x = 0; f = fun() { x = x + 1; return x; }; print(f()); print(f());",
        "1\n2\n",
    );
}

#[test]
fn test_records() {
    check(
        "r = {}; r.a = 1; r[\"b\"] = 2; print(r.a + r.b); print(r.missing);",
        "3\nNone\n",
    );
}

#[test]
fn test_division_by_zero_interpreted() {
    let err = run_with("x = 5; y = 0; print(x / y);", ExecMode::Interpret, 1000).unwrap_err();
    assert!(err.to_string().starts_with("ArithmeticError"));
}

#[test]
fn test_bool_plus_int_is_type_error_interpreted() {
    let err = run_with("x = true; print(x + 1);", ExecMode::Interpret, 1000).unwrap_err();
    assert!(err.to_string().starts_with("TypeError"));
}

#[test]
fn test_arithmetic_and_comparisons() {
    check(
        "print(7 - 2); print(6 * 7); print(9 / 2); print(-(3)); \
         print(3 > 2); print(2 > 3); print(2 >= 2); print(1 < 2); print(2 <= 1);",
        "5\n42\n4\n-3\ntrue\nfalse\ntrue\ntrue\nfalse\n",
    );
}

#[test]
fn test_booleans() {
    check(
        "print(true & false); print(true | false); print(!true);",
        "false\ntrue\nfalse\n",
    );
}

#[test]
fn test_equality_is_total() {
    check(
        "print(1 == 1); print(1 == 2); print(1 == \"1\"); print(\"a\" == \"a\"); \
         print(None == None); print(true == 1);",
        "true\nfalse\nfalse\ntrue\ntrue\nfalse\n",
    );
}

#[test]
fn test_record_equality_pointwise() {
    check(
        "a = { x: 1; }; b = { x: 1; }; c = a; print(a == b); print(a == c); \
         b.y = a; print(b == b);",
        "true\ntrue\ntrue\n",
    );
}

#[test]
fn test_while_loop_sum() {
    check(
        "i = 1; s = 0; while (i <= 100) { s = s + i; i = i + 1; } print(s);",
        "5050\n",
    );
}

#[test]
fn test_if_else() {
    check(
        "x = 3; if (x > 2) { print(\"big\"); } else { print(\"small\"); } \
         if (x > 5) { print(\"huge\"); } else { print(\"modest\"); }",
        "big\nmodest\n",
    );
}

#[test]
fn test_closure_captures_local_cell() {
    check(
        "mk = fun() { n = 0; get = fun() { return n; }; n = 42; return get; }; \
         g = mk(); print(g());",
        "42\n",
    );
}

#[test]
fn test_capture_through_two_levels() {
    check(
        "f = fun(x) { return fun() { return fun() { return x; }; }; }; \
         print(f(7)()());",
        "7\n",
    );
}

#[test]
fn test_adder_factory() {
    check(
        "adder = fun(x) { return fun(y) { return x + y; }; }; \
         add3 = adder(3); print(add3(4)); print(add3(10));",
        "7\n13\n",
    );
}

#[test]
fn test_recursion() {
    check(
        "fib = fun(n) { if (n < 2) { return n; } return fib(n - 1) + fib(n - 2); }; \
         print(fib(15));",
        "610\n",
    );
}

#[test]
fn test_function_without_return_yields_none() {
    check("f = fun() { x = 1; }; print(f());", "None\n");
}

#[test]
fn test_intcast() {
    check(
        "print(intcast(\"42\")); print(intcast(\"0\")); print(intcast(7)); \
         print(intcast(\"12abc\"));",
        "42\n0\n7\n12\n",
    );
}

#[test]
fn test_intcast_rejects_garbage_interpreted() {
    let err = run_with("print(intcast(\"abc\"));", ExecMode::Interpret, 1000).unwrap_err();
    assert!(err.to_string().starts_with("TypeError"));
}

#[test]
fn test_escape_expansion_on_print() {
    check("print(\"a\\nb\\tc\");", "a\nb\tc\n");
}

#[test]
fn test_record_display_is_key_sorted() {
    check("r = { b: 2; a: 1; }; print(r);", "{a:1 b:2 }\n");
}

#[test]
fn test_closure_displays_as_function() {
    check("f = fun() { return 1; }; print(f);", "FUNCTION\n");
}

#[test]
fn test_sneaky_global() {
    check(
        "setx = fun() { global x; x = 9; }; setx(); print(x);",
        "9\n",
    );
}

#[test]
fn test_integer_wrapping() {
    check(
        "big = 2147483647; print(big + 1);",
        "-2147483648\n",
    );
}

#[test]
fn test_division_wraps_at_int_min() {
    // INT_MIN / -1 has no 32-bit quotient; wrapping division yields
    // INT_MIN on both execution paths.
    check(
        "x = 2147483647 + 1; y = -(1); print(x / y); print(10 / y);",
        "-2147483648\n-10\n",
    );
}

#[test]
fn test_seed_scenarios_under_tight_heap() {
    check_tight_heap("print(1 + 2);", "3\n");
    check_tight_heap("x = \"a\"; x = x + 1; print(x);", "a1\n");
    check_tight_heap(
        "x = 0; f = fun() { x = x + 1; return x; }; print(f()); print(f());",
        "1\n2\n",
    );
    check_tight_heap(
        "r = {}; r.a = 1; r[\"b\"] = 2; print(r.a + r.b); print(r.missing);",
        "3\nNone\n",
    );
}

#[test]
fn test_gc_pressure_loop() {
    // Each iteration allocates a record that immediately becomes garbage.
    check_tight_heap(
        "i = 0; while (i < 20000) { r = { a: 1; }; i = i + 1; } print(i);",
        "20000\n",
    );
}

#[test]
fn test_collection_is_idempotent() {
    let mut vm = Vm::new_captured(VmOptions::default());
    let main = compile_source(
        &mut vm,
        "keep = { a: 1; }; i = 0; while (i < 100) { t = { b: 2; }; i = i + 1; }",
    )
    .unwrap();
    vm.run(main).unwrap();
    vm.heap.collect();
    let bytes = vm.heap.bytes();
    let count = vm.heap.count();
    vm.heap.collect();
    assert_eq!(vm.heap.bytes(), bytes);
    assert_eq!(vm.heap.count(), count);
}

#[test]
fn test_compiled_matches_interpreter_on_mixed_program() {
    let src = "\
        make_counter = fun() { \
            n = 0; \
            return fun() { return n; }; \
        }; \
        c = make_counter(); \
        r = { total: 0; }; \
        i = 1; \
        while (i <= 10) { r.total = r.total + i * i; i = i + 1; } \
        print(r.total); \
        print(c()); \
        print(\"done: \" + r.total);";
    let a = run_with(src, ExecMode::Interpret, 1000).unwrap();
    let b = run_with(src, ExecMode::Compile, 1000).unwrap();
    assert_eq!(a, b);
    assert_eq!(a, "385\n0\ndone: 385\n");
}
