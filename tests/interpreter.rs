use std::sync::Arc;

use quill::{
    BufferSink, CodeError, ErrorKind, Interpreter, Runtime, Value,
    lexer::{Lexer, TokenKind},
};

fn interpreter() -> (Interpreter, Arc<BufferSink>) {
    let runtime = Runtime::new().expect("runtime builds");
    let sink = Arc::new(BufferSink::new());
    let context = runtime.context(sink.clone());
    (Interpreter::new(context, "main"), sink)
}

fn eval(source: &str) -> Value {
    let (mut interpreter, _) = interpreter();
    interpreter
        .eval_source(source)
        .expect("evaluation should succeed")
}

fn eval_error(source: &str) -> CodeError {
    let (mut interpreter, _) = interpreter();
    match interpreter.eval_source(source) {
        Ok(value) => panic!("expected error, received value {value}"),
        Err(err) => err,
    }
}

fn assert_equals(actual: &Value, expected: Value) {
    assert!(actual.equals(&expected), "expected {expected:?}, got {actual:?}");
}

fn printed(source: &str) -> String {
    let (mut interpreter, sink) = interpreter();
    interpreter
        .eval_source(source)
        .expect("evaluation should succeed");
    sink.output()
}

#[test]
fn multiplication_before_addition() {
    let (mut interpreter, _) = interpreter();
    interpreter.eval_source("var x = 1 + 2 * 3;").unwrap();
    assert_eq!(interpreter.context().global("x"), Some(Value::number(7.0)));
}

#[test]
fn while_loop_counts_up() {
    let (mut interpreter, _) = interpreter();
    interpreter
        .eval_source("var x = 0; while (x < 3) { x = x + 1; }")
        .unwrap();
    assert_eq!(interpreter.context().global("x"), Some(Value::number(3.0)));
}

#[test]
fn too_many_arguments_is_runtime_error_at_call_site() {
    let error = eval_error("function add(a, b) { return a + b; }\nadd(1, 2, 3);");
    assert_eq!(error.kind, ErrorKind::Runtime);
    assert!(error.message.contains("too many arguments"), "{}", error.message);
    let span = error.span.expect("call span");
    assert_eq!(span.start.line, 2);
    assert_eq!(span.start.column, 1);
}

#[test]
fn too_few_arguments() {
    let error = eval_error("function add(a, b) { return a + b; } add(1);");
    assert_eq!(error.kind, ErrorKind::Runtime);
    assert!(error.message.contains("too few arguments"));
}

#[test]
fn subclass_override_wins() {
    let value = eval(
        r#"
        class Animal {
            function speak() { return "..."; }
            function describe() { return "I say " + this.speak(); }
        }
        class Dog extends Animal {
            constructor() {}
            function speak() { return "woof"; }
        }
        var d = new Dog();
        d.describe();
        "#,
    );
    assert_eq!(value, Value::string("I say woof"));
}

#[test]
fn inherited_methods_keep_their_defining_scope() {
    let value = eval(
        r#"
        function setup() {
            var secret = 42;
            class Base {
                function get() { return secret; }
                static function peek() { return secret + 1; }
                operator -() { return -secret; }
            }
        }
        setup();
        class Child extends Base { constructor() {} }
        var child = new Child();
        var bound = child.get;
        [child.get(), bound(), Child.peek(), -child];
        "#,
    );
    assert_equals(
        &value,
        Value::list(vec![
            Value::number(42.0),
            Value::number(42.0),
            Value::number(43.0),
            Value::number(-42.0),
        ]),
    );
}

#[test]
fn unterminated_string_is_illegal_char() {
    let error = eval_error("var s = \"never closed;");
    assert_eq!(error.kind, ErrorKind::IllegalChar);
    assert!(error.message.contains("unterminated"));
}

#[test]
fn control_signals_outside_their_context_are_illegal_operations() {
    for source in ["break;", "continue;", "return 1;", "{ break; }"] {
        let error = eval_error(source);
        assert_eq!(error.kind, ErrorKind::IllegalOperation, "{source}");
    }
    let error = eval_error("function f() { break; } f();");
    assert_eq!(error.kind, ErrorKind::IllegalOperation);
    assert!(error.message.contains("`break` outside loop"));
}

#[test]
fn break_and_continue_inside_loops() {
    let value = eval(
        r#"
        var i = 0;
        var total = 0;
        while (true) {
            i = i + 1;
            if (i > 10) break;
            if (i % 2 == 0) continue;
            total = total + i;
        }
        total;
        "#,
    );
    assert_eq!(value, Value::number(25.0));
}

#[test]
fn return_unwinds_through_loops() {
    let value = eval(
        r#"
        function find(items, wanted) {
            var i = 0;
            while (i < items.size()) {
                if (items[i] == wanted) { return i; }
                i = i + 1;
            }
            return -1;
        }
        find([4, 8, 15, 16], 15);
        "#,
    );
    assert_eq!(value, Value::number(2.0));
}

#[test]
fn closures_capture_their_defining_scope() {
    let value = eval(
        r#"
        function counter() {
            var count = 0;
            return function() { count = count + 1; return count; };
        }
        var next = counter();
        next();
        next();
        next();
        "#,
    );
    assert_eq!(value, Value::number(3.0));
}

#[test]
fn rest_parameters_collect_surplus_arguments() {
    let value = eval(
        r#"
        function count(first, ...others) { return others.size(); }
        count(1, 2, 3, 4);
        "#,
    );
    assert_eq!(value, Value::number(3.0));
}

#[test]
fn operator_overloading_and_fallbacks() {
    let value = eval(
        r#"
        class Vec {
            var x = 0;
            var y = 0;
            constructor(x, y) { this.x = x; this.y = y; }
            operator +(other) { return new Vec(this.x + other.x, this.y + other.y); }
            operator -() { return new Vec(-this.x, -this.y); }
            operator ==(other) { return this.x == other.x && this.y == other.y; }
        }
        var a = new Vec(1, 2) + new Vec(3, 4);
        var b = -a;
        [a.x, a.y, b.x, a == new Vec(4, 6)];
        "#,
    );
    assert_equals(
        &value,
        Value::list(vec![
            Value::number(4.0),
            Value::number(6.0),
            Value::number(-4.0),
            Value::bool(true),
        ])
    );
}

#[test]
fn equality_without_operator_is_identity() {
    let value = eval(
        r#"
        class Point { }
        var p = new Point();
        [p == p, p == new Point()];
        "#,
    );
    assert_equals(&value, Value::list(vec![Value::bool(true), Value::bool(false)]));
}

#[test]
fn incompatible_operands_name_operator_and_value() {
    let error = eval_error("true - 1;");
    assert_eq!(error.kind, ErrorKind::IllegalOperation);
    assert!(error.message.contains("`-`"), "{}", error.message);
    assert!(error.message.contains("true"), "{}", error.message);
}

#[test]
fn conditions_must_be_boolean() {
    assert_eq!(eval_error("if (1) { }").kind, ErrorKind::IllegalOperation);
    assert_eq!(eval_error("while (null) { }").kind, ErrorKind::IllegalOperation);
    assert_eq!(eval_error("1 && true;").kind, ErrorKind::IllegalOperation);
}

#[test]
fn logical_operators_short_circuit() {
    let value = eval("false && error(\"not reached\");");
    assert_eq!(value, Value::bool(false));
    let value = eval("true || error(\"not reached\");");
    assert_eq!(value, Value::bool(true));
}

#[test]
fn string_and_list_operators() {
    assert_eq!(eval("\"n=\" + 4;"), Value::string("n=4"));
    assert_eq!(eval("\"apple\" < \"banana\";"), Value::bool(true));
    assert_equals(
        &eval("[1] + [2];"),
        Value::list(vec![Value::number(1.0), Value::number(2.0)]),
    );
    assert_eq!(eval("2 ^ 10;"), Value::number(1024.0));
    assert_eq!(eval("-2 ^ 2;"), Value::number(-4.0));
}

#[test]
fn string_repetition_is_not_an_operator() {
    let error = eval_error("\"ab\" * 3;");
    assert_eq!(error.kind, ErrorKind::IllegalOperation);
    assert!(error.message.contains("`*`"), "{}", error.message);
    assert_eq!(eval_error("\"ab\" * 1e19;").kind, ErrorKind::IllegalOperation);
}

#[test]
fn container_equality_is_structural() {
    let value = eval("[[1, 2] == [1, 2], {\"a\": [1]} == {\"a\": [1]}, [1] != [2]];");
    assert_equals(
        &value,
        Value::list(vec![Value::bool(true), Value::bool(true), Value::bool(true)]),
    );
}

#[test]
fn self_containing_collections_render_and_compare() {
    let value = eval(
        r#"
        var l = [1];
        l.add(l);
        var m = {};
        m["self"] = m;
        var other = [1];
        other.add(other);
        [str(l), str(m), l == other, l.contains(l)];
        "#,
    );
    assert_equals(
        &value,
        Value::list(vec![
            Value::string("[1, [...]]"),
            Value::string("{\"self\": {...}}"),
            Value::bool(true),
            Value::bool(true),
        ]),
    );
}

#[test]
fn collections_key_themselves_by_identity() {
    let value = eval(
        r#"
        var m = {};
        m[m] = 1;
        var s = set();
        s.add(s);
        var k = [1];
        m[k] = 2;
        [m[m], s.contains(s), m[k], m.containsKey([1]), m.size()];
        "#,
    );
    assert_equals(
        &value,
        Value::list(vec![
            Value::number(1.0),
            Value::bool(true),
            Value::number(2.0),
            Value::bool(false),
            Value::number(2.0),
        ]),
    );
}

#[test]
fn division_by_zero_is_runtime_error() {
    assert_eq!(eval_error("1 / 0;").kind, ErrorKind::Runtime);
    assert_eq!(eval_error("1 % 0;").kind, ErrorKind::Runtime);
}

#[test]
fn field_initializers_run_root_first_before_constructor() {
    let value = eval(
        r#"
        var log = [];
        class Base {
            var a = log.add("base");
        }
        class Child extends Base {
            var b = log.add("child");
            constructor() { log.add("ctor"); }
        }
        new Child();
        log;
        "#,
    );
    assert_equals(
        &value,
        Value::list(vec![
            Value::string("base"),
            Value::string("child"),
            Value::string("ctor"),
        ])
    );
}

#[test]
fn constructor_is_chosen_by_arity() {
    let value = eval(
        r#"
        class Box {
            var value = null;
            constructor() { this.value = "empty"; }
            constructor(v) { this.value = v; }
        }
        [new Box().value, new Box(5).value];
        "#,
    );
    assert_equals(
        &value,
        Value::list(vec![Value::string("empty"), Value::number(5.0)])
    );
    let error = eval_error("class C { constructor(a) {} } new C();");
    assert_eq!(error.kind, ErrorKind::Runtime);
}

#[test]
fn subclass_without_constructor_is_not_constructible() {
    let error = eval_error("class A { } class B extends A { } new B();");
    assert_eq!(error.kind, ErrorKind::Runtime);
    assert!(error.message.contains("not constructible"), "{}", error.message);
}

#[test]
fn static_members_live_on_the_class() {
    let value = eval(
        r#"
        class Counter {
            static var created = 0;
            static function make() {
                Counter.created = Counter.created + 1;
                return new Counter();
            }
        }
        Counter.make();
        Counter.make();
        Counter.created;
        "#,
    );
    assert_eq!(value, Value::number(2.0));
}

#[test]
fn methods_are_bound_when_read_as_values() {
    let value = eval(
        r#"
        class Greeter {
            var name = "quill";
            function greet() { return "hi " + this.name; }
        }
        var g = new Greeter().greet;
        g();
        "#,
    );
    assert_eq!(value, Value::string("hi quill"));
}

#[test]
fn bound_overloads_resolve_by_argument_count() {
    let value = eval(
        r#"
        class Shout {
            function say() { return "..."; }
            function say(word) { return word + "!"; }
            static function make() { return "zero"; }
            static function make(n) { return n; }
        }
        var say = new Shout().say;
        var make = Shout.make;
        [say(), say("hey"), make(), make(7)];
        "#,
    );
    assert_equals(
        &value,
        Value::list(vec![
            Value::string("..."),
            Value::string("hey!"),
            Value::string("zero"),
            Value::number(7.0),
        ]),
    );
    let error = eval_error(
        "class Shout { function say() {} } var say = new Shout().say; say(1, 2);",
    );
    assert_eq!(error.kind, ErrorKind::Runtime);
    assert!(error.message.contains("no overload"), "{}", error.message);
}

#[test]
fn duplicate_method_signature_is_rejected() {
    let error = eval_error("class A { function f(x) {} function f(y) {} }");
    assert_eq!(error.kind, ErrorKind::IllegalOperation);
}

#[test]
fn unknown_identifier_at_runtime() {
    let error = eval_error("missing + 1;");
    assert_eq!(error.kind, ErrorKind::UnknownIdentifier);
    assert!(error.message.contains("`missing`"));
}

#[test]
fn traceback_records_each_unwound_call() {
    let error = eval_error(
        "function inner() { error(\"bad\"); }\nfunction outer() { inner(); }\nouter();",
    );
    assert_eq!(error.kind, ErrorKind::Runtime);
    let labels: Vec<_> = error.traceback.iter().map(|e| e.label.as_str()).collect();
    let inner = labels.iter().position(|l| *l == "call to inner").unwrap();
    let outer = labels.iter().position(|l| *l == "call to outer").unwrap();
    assert!(inner < outer, "{labels:?}");
    assert_eq!(labels.last(), Some(&"<program>"));
    assert!(error.traceback.iter().all(|e| &*e.display_name == "main"));
}

#[test]
fn scope_pushes_match_pops_even_on_signals_and_errors() {
    let (mut interpreter, _) = interpreter();
    interpreter
        .eval_source(
            r#"
            function f(n) {
                var i = 0;
                while (true) {
                    { i = i + 1; if (i == n) { return i; } }
                }
            }
            f(5);
            "#,
        )
        .unwrap();
    let _ = interpreter.eval_source("function g() { { { error(\"x\"); } } } g();");
    let stats = interpreter.stats();
    assert_eq!(stats.scopes_pushed, stats.scopes_popped);
    assert!(stats.calls >= 3);
}

#[test]
fn deep_recursion_becomes_runtime_error() {
    let error = eval_error("function down(n) { return down(n + 1); } down(0);");
    assert_eq!(error.kind, ErrorKind::Runtime);
    assert!(error.message.contains("maximum recursion depth"));
}

#[test]
fn builtin_collections_and_strings() {
    let value = eval(
        r#"
        var m = {"a": 1};
        m.put("b", 2);
        m["c"] = 3;
        var s = set(1, 2, 2, 3);
        var words = "a,b,c".split(",");
        [m.size(), m.get("b"), m.containsKey("z"), s.size(), words.size(),
         "Quill".upper(), "Quill".substring(1, 3), len("héllo"), type(m)];
        "#,
    );
    assert_equals(
        &value,
        Value::list(vec![
            Value::number(3.0),
            Value::number(2.0),
            Value::bool(false),
            Value::number(3.0),
            Value::number(3.0),
            Value::string("QUILL"),
            Value::string("ui"),
            Value::number(5.0),
            Value::string("Map"),
        ])
    );
}

#[test]
fn attempt_turns_errors_into_values() {
    let value = eval(
        r#"
        var result = attempt(function() { error("nope"); });
        [result.kind(), result.message()];
        "#,
    );
    assert_equals(
        &value,
        Value::list(vec![Value::string("Runtime Error"), Value::string("nope")])
    );
}

#[test]
fn print_writes_to_the_output_sink() {
    assert_eq!(printed("print(\"a\", 1); println(\"b\");"), "a 1b\n");
    assert_eq!(printed("println([1, \"x\"], null);"), "[1, \"x\"] null\n");
}

#[test]
fn index_out_of_bounds_is_runtime_error() {
    assert_eq!(eval_error("[1, 2][5];").kind, ErrorKind::Runtime);
    assert_eq!(eval_error("[1, 2].get(-1);").kind, ErrorKind::Runtime);
}

#[test]
fn async_builtins_need_a_manager() {
    let error = eval_error("runAsync(function() {});");
    assert_eq!(error.kind, ErrorKind::Runtime);
}

#[test]
fn type_mismatch_in_native_argument() {
    let error = eval_error("sqrt(\"four\");");
    assert_eq!(error.kind, ErrorKind::IllegalOperation);
}

#[test]
fn token_spans_tile_the_source() {
    let source = "var x = 1; // note\nwhile (x < 3) { x = x + 1; }";
    let lexer = Lexer::new().unwrap();
    let tokens = lexer.tokenize(source, &Arc::from("main")).unwrap();
    let mut last_end = 0;
    for token in &tokens {
        assert!(token.span.start.offset >= last_end);
        let gap = &source[last_end..token.span.start.offset];
        assert!(
            gap.trim().is_empty() || gap.trim_start().starts_with("//"),
            "unexpected gap {gap:?}"
        );
        if token.kind != TokenKind::Eof {
            assert_eq!(&source[token.span.start.offset..token.span.end.offset], token.lexeme);
        }
        last_end = token.span.end.offset;
    }
    assert_eq!(tokens.last().map(|t| t.kind), Some(TokenKind::Eof));
}

#[test]
fn parsing_twice_is_deterministic() {
    let runtime = Runtime::new().unwrap();
    let context = runtime.context(Arc::new(BufferSink::new()));
    let source = "var f = function(a) { return a * 2; }; class A { function m() { return 1; } }";
    let first = context.compile("main", source).unwrap();
    let second = context.compile("main", source).unwrap();
    assert_eq!(first, second);
}

#[test]
fn host_natives_are_callable() {
    fn twice(
        _: &mut quill::CallContext<'_>,
        _: Option<&Value>,
        args: Vec<Value>,
    ) -> Result<Value, quill::diagnostics::Unwind> {
        Ok(Value::number(args[0].as_number().unwrap_or_default() * 2.0))
    }
    let runtime = Runtime::builder()
        .register_native(
            "twice",
            quill::Signature::new(["Number"]).returns("Number"),
            twice,
        )
        .unwrap()
        .build()
        .unwrap();
    let context = runtime.context(Arc::new(BufferSink::new()));
    let mut interpreter = Interpreter::new(context, "main");
    assert_eq!(interpreter.eval_source("twice(21);").unwrap(), Value::number(42.0));
    let error = interpreter.eval_source("var twice = 1;").unwrap_err();
    assert_eq!(error.kind, ErrorKind::IllegalOperation);
}
