use std::sync::Arc;

use edl::compile;
use edl::device::{Device, DeviceSet};
use edl::error::{DeviceResult, Error, InterpretError, StoreError};
use edl::interpreter::{self, Emission, RunEnd, Value};
use edl::program::Location;
use parking_lot::Mutex;

fn recorded(emissions: &[Emission], wanted: &str) -> Vec<Value> {
    emissions
        .iter()
        .filter_map(|emission| match emission {
            Emission::Record { name, value, .. } if name == wanted => Some(value.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn repeat_runs_body_exactly_n_times() {
    for n in [0i64, 1, 3, 7] {
        let src = format!("count = 0;\nrepeat {n} {{\n  count += 1;\n  record(\"pass\", count);\n}}\nrecord(\"count\", count);\n");
        let mut program = compile("repeat.edl", &src).expect("compile");
        let mut devices = DeviceSet::new();
        let report = interpreter::test_run(&mut program, &mut devices, None, 100).expect("test run");
        assert_eq!(report.end, RunEnd::Completed);
        assert_eq!(recorded(&report.emissions, "count"), vec![Value::Int(n)]);
        assert_eq!(recorded(&report.emissions, "pass").len(), n as usize);
    }
}

#[test]
fn for_loop_visits_inclusive_range_in_order() {
    let mut program =
        compile("for.edl", "for i = 0 : 4 : 1 {\n  record(\"i\", i);\n}\n").expect("compile");
    let mut devices = DeviceSet::new();
    let report = interpreter::test_run(&mut program, &mut devices, None, 100).expect("test run");
    assert_eq!(
        recorded(&report.emissions, "i"),
        (0..=4).map(Value::Int).collect::<Vec<_>>()
    );
}

#[test]
fn program_can_run_twice_after_test_run() {
    let src = "total = 0;\nfor i = 1 : 3 {\n  repeat 2 { total += i; }\n}\nrecord(\"total\", total);\n";
    let mut program = compile("twice.edl", src).expect("compile");
    let mut devices = DeviceSet::new();
    for _ in 0..2 {
        let report = interpreter::test_run(&mut program, &mut devices, None, 100).expect("test run");
        assert_eq!(recorded(&report.emissions, "total"), vec![Value::Int(12)]);
    }
}

#[test]
fn syntax_check_reaches_untaken_branches() {
    let src = "x = 1;\nif 0 {\n  y = = 2;\n}\n";
    let mut program = compile("hidden.edl", src).expect("compile");
    let devices = DeviceSet::new();

    let err = interpreter::syntax_check(&program, &devices).unwrap_err();
    match err {
        InterpretError::Syntax { location, .. } => {
            assert_eq!(location, Location::new("hidden.edl", 3))
        }
        other => panic!("expected syntax error, got {other}"),
    }

    // the test run alone never notices
    let mut devices = DeviceSet::new();
    let report = interpreter::test_run(&mut program, &mut devices, None, 100).expect("test run");
    assert_eq!(report.end, RunEnd::Completed);
}

#[test]
fn syntax_check_reports_unknown_functions() {
    let program = compile("unknown.edl", "unless 1 {\n  frobnicate(3);\n}\n").expect("compile");
    let err = interpreter::syntax_check(&program, &DeviceSet::new()).unwrap_err();
    assert!(err.to_string().contains("frobnicate"), "{err}");

    let devices = DeviceSet::from_names(&["sim_meter"]).expect("devices");
    let program = compile("known.edl", "if 0 { sim_meter_read(); }").expect("compile");
    interpreter::syntax_check(&program, &devices).expect("device functions are known");
}

#[test]
fn extra_open_brace_names_its_location() {
    let src = "x = 1;\nwhile x < 3 {\n  if x == 2 {\n    x += 1;\n  }\n  x += 1;\n";
    match compile("brace.edl", src) {
        Err(Error::Store(StoreError::UnclosedBrace { location })) => {
            assert_eq!(location, Location::new("brace.edl", 2));
        }
        other => panic!("expected unclosed brace, got {other:?}"),
    }
}

#[test]
fn on_stop_cannot_split_a_construct() {
    for src in [
        "while x < 3 {\nON_STOP:\n  x += 1;\n}\n",
        "if x {\n} else {\nON_STOP:\n}\n",
        "repeat ON_STOP: 3 { x = 1; }\n",
        "y = (1 +\nON_STOP:\n2);\n",
    ] {
        match compile("onstop.edl", src) {
            Err(Error::Store(StoreError::MisplacedOnStop { .. })) => {}
            other => panic!("accepted {src:?}: {other:?}"),
        }
    }

    let program = compile("onstop.edl", "x = 1;\nON_STOP:\nx = 2;\n").expect("top level marker");
    assert_eq!(program.on_stop(), Some(4));
}

#[test]
fn test_run_reaching_on_stop_runs_the_section() {
    let mut program =
        compile("tail.edl", "record(\"a\", 1);\nON_STOP:\nrecord(\"b\", 2);\n").expect("compile");
    let mut devices = DeviceSet::new();
    let report = interpreter::test_run(&mut program, &mut devices, None, 100).expect("test run");
    assert_eq!(report.end, RunEnd::Completed);
    assert_eq!(recorded(&report.emissions, "b"), vec![Value::Int(2)]);
}

/// Device that journals the test-run hooks it sees.
struct Journaling(Arc<Mutex<Vec<&'static str>>>);

impl Device for Journaling {
    fn name(&self) -> &str {
        "journal"
    }

    fn test_hook(&mut self) -> DeviceResult<()> {
        self.0.lock().push("test");
        Ok(())
    }

    fn end_of_test_hook(&mut self) -> DeviceResult<()> {
        self.0.lock().push("end_of_test");
        Ok(())
    }
}

#[test]
fn fatal_errors_abort_the_test_run_and_still_clean_up() {
    let mut program = compile(
        "fatal.edl",
        "record(\"before\", 1);\nfor i = 1 : 5 : 0 {\n  record(\"i\", i);\n}\nrecord(\"after\", 1);\n",
    )
    .expect("compile");
    let journal = Arc::new(Mutex::new(Vec::new()));
    let mut devices = DeviceSet::from_names(&["sim_meter"]).expect("devices");
    devices.push(Box::new(Journaling(journal.clone())));

    let err = interpreter::test_run(&mut program, &mut devices, None, 100).unwrap_err();
    assert!(matches!(
        err,
        Error::Interpret(InterpretError::Fatal { .. })
    ));
    assert_eq!(*journal.lock(), vec!["test", "end_of_test"]);
}
