// SPDX-License-Identifier: MIT OR Apache-2.0
//! The restricted program language executed inside sandboxed steps.
//!
//! A deterministic, Python-shaped scripting language: indentation-sensitive
//! blocks, a curated builtin set, shared-reference list/dict values, and a
//! capability-object seam ([`NativeObject`]) through which the sandbox
//! injects `context`, `state` companions, and `tool`.
//!
//! The interpreter is a plain tree walk with a monotonic-deadline hook
//! checked at a fixed evaluation-event cadence. Programs cannot observe the
//! clock, randomness, or the environment, so identical inputs produce
//! identical outputs, stdout, and side-effect order.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod ast;
pub mod interp;
pub mod lexer;
pub mod parser;
pub mod token;
pub mod value;

pub use ast::{
    BinOp, BoolOp, CmpOp, Expr, ExprKind, ForTarget, FStringPart, Program, Stmt, StmtKind, Target,
    UnaryOp,
};
pub use interp::{Interp, InterpConfig, InterpOutcome};
pub use parser::{ParseError, parse_program};
pub use value::{CallArgs, NativeObject, RunError, Value};

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn run_program(source: &str) -> (String, Result<(), RunError>) {
        let program = parse_program(source).expect("parse");
        let mut interp = Interp::new(InterpConfig::default());
        let outcome = interp.run(&program, BTreeMap::new());
        (outcome.stdout, outcome.result)
    }

    fn run_ok(source: &str) -> String {
        let (stdout, result) = run_program(source);
        result.expect("program should succeed");
        stdout
    }

    #[test]
    fn arithmetic_and_printing() {
        assert_eq!(run_ok("print(1 + 2 * 3)"), "7\n");
        assert_eq!(run_ok("print(7 // 2, 7 % 2, -7 // 2)"), "3 1 -4\n");
        assert_eq!(run_ok("print(1 / 2)"), "0.5\n");
    }

    #[test]
    fn string_operations() {
        assert_eq!(run_ok(r#"print("al" + "pha")"#), "alpha\n");
        assert_eq!(run_ok(r#"print("Alpha beta"[0:5])"#), "Alpha\n");
        assert_eq!(run_ok(r#"print("Alpha"[-1])"#), "a\n");
        assert_eq!(run_ok(r#"print("a,b,c".split(","))"#), "['a', 'b', 'c']\n");
        assert_eq!(run_ok(r#"print("-".join(["x", "y"]))"#), "x-y\n");
        assert_eq!(run_ok(r#"print("Alpha".lower(), "beta".upper())"#), "alpha BETA\n");
        assert_eq!(run_ok(r#"print("hello".find("ll"), "hello".find("zz"))"#), "2 -1\n");
        assert_eq!(run_ok(r#"print("  pad  ".strip())"#), "pad\n");
        assert_eq!(run_ok(r#"print("aXbXc".replace("X", "-"))"#), "a-b-c\n");
        assert_eq!(run_ok(r#"print("banana".count("an"))"#), "2\n");
        assert_eq!(
            run_ok(r#"print("pre".startswith("p"), "pre".endswith("x"))"#),
            "True False\n"
        );
    }

    #[test]
    fn list_and_dict_mutation_is_shared() {
        let stdout = run_ok(
            "work = {}\nwork[\"hits\"] = []\nalias = work[\"hits\"]\nalias.append(3)\nprint(work[\"hits\"])\n",
        );
        assert_eq!(stdout, "[3]\n");
    }

    #[test]
    fn dict_methods() {
        let stdout = run_ok(
            "d = {\"b\": 2, \"a\": 1}\nprint(d.get(\"a\"), d.get(\"z\"), d.get(\"z\", 9))\nprint(sorted(d.keys()))\nprint(d.setdefault(\"c\", 3), d[\"c\"])\n",
        );
        assert_eq!(stdout, "1 None 9\n['a', 'b']\n3 3\n");
    }

    #[test]
    fn for_loops_and_ranges() {
        assert_eq!(run_ok("total = 0\nfor i in range(5):\n    total += i\nprint(total)\n"), "10\n");
        assert_eq!(run_ok("for i in range(2, 5):\n    print(i)\n"), "2\n3\n4\n");
        let stdout = run_ok(
            "for i, ch in enumerate([\"a\", \"b\"]):\n    print(i, ch)\n",
        );
        assert_eq!(stdout, "0 a\n1 b\n");
    }

    #[test]
    fn dict_iteration_is_sorted_by_key() {
        let stdout = run_ok(
            "d = {\"z\": 1, \"a\": 2}\nfor k in d:\n    print(k)\nfor k, v in d.items():\n    print(k, v)\n",
        );
        assert_eq!(stdout, "a\nz\na 2\nz 1\n");
    }

    #[test]
    fn while_break_continue() {
        let stdout = run_ok(
            "n = 0\nwhile True:\n    n += 1\n    if n == 3:\n        continue\n    if n > 4:\n        break\n    print(n)\n",
        );
        assert_eq!(stdout, "1\n2\n4\n");
    }

    #[test]
    fn conditionals_and_membership() {
        let stdout = run_ok(
            "state = {}\nif \"work\" not in state:\n    state[\"work\"] = {}\nif \"work\" in state:\n    print(\"ready\")\nelif True:\n    print(\"no\")\nelse:\n    print(\"never\")\n",
        );
        assert_eq!(stdout, "ready\n");
    }

    #[test]
    fn semicolons_separate_simple_statements() {
        assert_eq!(run_ok("a = 1; b = a + 1; print(b)"), "2\n");
    }

    #[test]
    fn fstrings_interpolate_expressions() {
        let stdout = run_ok("hits = [1, 2, 3]\nprint(f\"Found {len(hits)} hits ({hits[0]}).\")\n");
        assert_eq!(stdout, "Found 3 hits (1).\n");
    }

    #[test]
    fn builtins_behave() {
        assert_eq!(run_ok("print(min(3, 1), max([2, 9, 4]), sum([1, 2, 3]))"), "1 9 6\n");
        assert_eq!(run_ok("print(sorted([3, 1, 2]), sorted([\"b\", \"a\"]))"), "[1, 2, 3] ['a', 'b']\n");
        assert_eq!(run_ok("print(abs(-4), round(2.6))"), "4 3\n");
        assert_eq!(run_ok("print(int(\"12\") + 1, float(2), str(9) + \"!\")"), "13 2.0 9!\n");
        assert_eq!(run_ok("print(len(\"héllo\"))"), "5\n");
        assert_eq!(run_ok("print(isinstance(1, int), isinstance(\"x\", int))"), "True False\n");
        assert_eq!(run_ok("print(reversed([1, 2, 3]))"), "[3, 2, 1]\n");
    }

    #[test]
    fn zip_pairs_up_to_the_shortest() {
        assert_eq!(
            run_ok("print(zip([1, 2, 3], [\"a\", \"b\"]))"),
            "[(1, 'a'), (2, 'b')]\n"
        );
        let stdout = run_ok(
            "for i, ch in zip([0, 1], [\"x\", \"y\"]):\n    print(i, ch)\n",
        );
        assert_eq!(stdout, "0 x\n1 y\n");
    }

    #[test]
    fn map_and_filter_take_builtin_names() {
        assert_eq!(run_ok("print(map(str, [1, 2]))"), "['1', '2']\n");
        assert_eq!(run_ok("print(map(abs, [-1, 2, -3]))"), "[1, 2, 3]\n");
        assert_eq!(run_ok("print(filter(bool, [0, 1, \"\", \"x\"]))"), "[1, 'x']\n");
        assert_eq!(run_ok("print(filter(None, [0, 2, None, 3]))"), "[2, 3]\n");
        let (_, result) = run_program("print(map(missing, [1]))");
        assert!(matches!(
            result.unwrap_err(),
            RunError::Exception { kind, .. } if kind == "TypeError"
        ));
    }

    #[test]
    fn tuples_index_slice_and_unpack() {
        assert_eq!(run_ok("t = tuple([1, 2, 3])\nprint(t, t[0], t[-1], len(t))\n"), "(1, 2, 3) 1 3 3\n");
        assert_eq!(run_ok("print(tuple([1])[0:1], tuple([]))"), "(1,) ()\n");
        assert_eq!(run_ok("print(2 in tuple([1, 2]), 9 in tuple([1, 2]))"), "True False\n");
        let stdout = run_ok("d = {\"a\": 1}\nfor k, v in d.items():\n    print(k, v)\n");
        assert_eq!(stdout, "a 1\n");
        assert_eq!(run_ok("print(isinstance(tuple([]), tuple))"), "True\n");
    }

    #[test]
    fn sets_dedupe_and_iterate_sorted() {
        assert_eq!(
            run_ok("s = set([3, 1, 3, 2])\nprint(len(s), sorted(s), 2 in s, 9 in s)\n"),
            "3 [1, 2, 3] True False\n"
        );
        assert_eq!(run_ok("print(set([2, 1]), set())"), "{1, 2} set()\n");
        // Numeric elements dedupe across int/float.
        assert_eq!(run_ok("print(len(set([1, 1.0, 2])))"), "2\n");
        let stdout = run_ok("s = set([\"b\"])\ns.add(\"a\")\ns.add(\"b\")\nprint(sorted(s))\n");
        assert_eq!(stdout, "['a', 'b']\n");
        assert_eq!(run_ok("print(isinstance(set(), set))"), "True\n");
        let (_, result) = run_program("s = set([[1]])");
        assert!(matches!(
            result.unwrap_err(),
            RunError::Exception { kind, .. } if kind == "TypeError"
        ));
    }

    #[test]
    fn name_error_is_an_exception() {
        let (_, result) = run_program("print(missing)");
        match result.unwrap_err() {
            RunError::Exception { kind, .. } => assert_eq!(kind, "NameError"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn key_and_index_errors() {
        let (_, result) = run_program("d = {}\nprint(d[\"missing\"])\n");
        assert!(matches!(
            result.unwrap_err(),
            RunError::Exception { kind, .. } if kind == "KeyError"
        ));
        let (_, result) = run_program("xs = [1]\nprint(xs[5])\n");
        assert!(matches!(
            result.unwrap_err(),
            RunError::Exception { kind, .. } if kind == "IndexError"
        ));
    }

    #[test]
    fn division_by_zero() {
        let (_, result) = run_program("print(1 // 0)");
        assert!(matches!(
            result.unwrap_err(),
            RunError::Exception { kind, .. } if kind == "ZeroDivisionError"
        ));
    }

    #[test]
    fn deadline_trips_infinite_loops() {
        let program = parse_program("while True:\n    pass\n").unwrap();
        let mut interp = Interp::new(InterpConfig {
            deadline: Some(std::time::Instant::now() + std::time::Duration::from_millis(30)),
        });
        let outcome = interp.run(&program, BTreeMap::new());
        assert!(matches!(outcome.result.unwrap_err(), RunError::Timeout));
    }

    #[test]
    fn dict_keys_must_be_strings() {
        let (_, result) = run_program("d = {}\nd[1] = 2\n");
        assert!(matches!(
            result.unwrap_err(),
            RunError::Exception { kind, .. } if kind == "TypeError"
        ));
    }

    #[test]
    fn comparison_and_boolean_logic() {
        assert_eq!(run_ok("print(1 < 2 and 2 <= 2 and not False)"), "True\n");
        assert_eq!(run_ok("print(\"a\" < \"b\", 1.5 > 1, 2 == 2.0)"), "True True True\n");
        assert_eq!(run_ok("print(None == None, [1] == [1], {\"a\": 1} == {\"a\": 1})"), "True True True\n");
        // Short-circuit: the right side would raise.
        assert_eq!(run_ok("print(False and missing)"), "False\n");
        assert_eq!(run_ok("print(True or missing)"), "True\n");
    }

    #[test]
    fn list_slicing_and_concat() {
        assert_eq!(run_ok("xs = [1, 2, 3, 4]\nprint(xs[1:3], xs[:2], xs[-2:])"), "[2, 3] [1, 2] [3, 4]\n");
        assert_eq!(run_ok("print([1] + [2, 3])"), "[1, 2, 3]\n");
        let stdout = run_ok("xs = [1, 2]\nxs.extend([3])\nxs[0] = 9\nprint(xs)\n");
        assert_eq!(stdout, "[9, 2, 3]\n");
    }

    #[test]
    fn stdout_captures_in_program_order() {
        assert_eq!(run_ok("print(\"a\")\nprint(\"b\", \"c\")\n"), "a\nb c\n");
    }
}
