//! End-to-end tests: compile a source string with the prelude, run it,
//! and observe the program's output and exit behavior.

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tern_parser::{CompileOptions, Compiler};
use tern_vm::{Outcome, Vm, PRELUDE};

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn write_temp(name: &str, src: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("tern_vm_tests");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, src).unwrap();
    path
}

fn run(name: &str, src: &str) -> (Outcome, String) {
    run_with_args(name, src, &[])
}

fn run_with_args(name: &str, src: &str, args: &[&str]) -> (Outcome, String) {
    let path = write_temp(name, src);
    let options = CompileOptions {
        search_paths: Vec::new(),
        native_modules: vec![PRELUDE],
    };
    let mut compiler = Compiler::new(options);
    let program = match compiler.compile_file(&path) {
        Ok(p) => p,
        Err(_) => panic!("compile failed:\n{}", compiler.diags.render()),
    };
    let capture = Capture::default();
    let mut vm = Vm::new(program);
    vm.output = Box::new(capture.clone());
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    let outcome = vm.run(&args);
    let text = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
    (outcome, text)
}

#[test]
fn minimal_program_prints_and_exits_cleanly() {
    let (outcome, out) = run("hello.tn", "def Main()\n  WriteLn(\"hi\")\nend\n");
    assert_eq!(outcome, Outcome::Finished);
    assert_eq!(out, "hi\n");
}

#[test]
fn multiple_assignment_swaps_in_place() {
    let src = "\
def Main()
  var a, b = 1, 2
  a, b = b, a
  WriteLn(a)
  WriteLn(b)
end
";
    let (outcome, out) = run("swap.tn", src);
    assert_eq!(outcome, Outcome::Finished);
    assert_eq!(out, "2\n1\n");
}

#[test]
fn anonymous_function_captures_by_cell_not_by_value() {
    let src = "\
def f()
  var x = 10
  var g = def ()
    return x
  end
  x = 20
  return g()
end

def Main()
  WriteLn(f())
end
";
    let (outcome, out) = run("capture.tn", src);
    assert_eq!(outcome, Outcome::Finished);
    assert_eq!(out, "20\n");
}

#[test]
fn inner_writes_through_the_cell_are_visible_outside() {
    let src = "\
def Main()
  var x = 1
  var bump = def ()
    x = x + 1
  end
  bump()
  bump()
  WriteLn(x)
end
";
    let (outcome, out) = run("cell_write.tn", src);
    assert_eq!(outcome, Outcome::Finished);
    assert_eq!(out, "3\n");
}

#[test]
fn finally_overrides_the_try_return() {
    let src = "\
def f()
  try
    return 1
  finally
    return 2
  end
end

def Main()
  WriteLn(f())
end
";
    let (outcome, out) = run("finally_return.tn", src);
    assert_eq!(outcome, Outcome::Finished);
    assert_eq!(out, "2\n");
}

#[test]
fn finally_runs_on_the_normal_path_too() {
    let src = "\
def Main()
  try
    WriteLn(\"body\")
  finally
    WriteLn(\"finally\")
  end
  WriteLn(\"after\")
end
";
    let (outcome, out) = run("finally_normal.tn", src);
    assert_eq!(outcome, Outcome::Finished);
    assert_eq!(out, "body\nfinally\nafter\n");
}

#[test]
fn except_catches_by_subtype() {
    let src = "\
def Main()
  try
    raise ValueError(\"boom\")
  except e is Exception
    WriteLn(\"caught\")
  end
end
";
    let (outcome, out) = run("except.tn", src);
    assert_eq!(outcome, Outcome::Finished);
    assert_eq!(out, "caught\n");
}

#[test]
fn unmatched_exceptions_propagate_through_handlers() {
    let src = "\
def Main()
  try
    raise ValueError(\"boom\")
  except e is IndexError
    WriteLn(\"wrong handler\")
  end
end
";
    let (outcome, out) = run("except_miss.tn", src);
    assert_eq!(out, "");
    match outcome {
        Outcome::Uncaught(rendered) => {
            assert!(rendered.contains("ValueError"));
            assert!(rendered.contains("boom"));
            assert!(rendered.contains("Main"));
        }
        other => panic!("expected uncaught, got {other:?}"),
    }
}

#[test]
fn runtime_errors_are_catchable_in_a_direct_try() {
    let src = "\
def Main()
  try
    var a = 1 div 0
  except ArithmeticError
    WriteLn(\"division\")
  end
end
";
    let (outcome, out) = run("direct_try.tn", src);
    assert_eq!(outcome, Outcome::Finished);
    assert_eq!(out, "division\n");
}

#[test]
fn finally_runs_while_an_exception_unwinds() {
    let src = "\
def f()
  try
    raise ValueError(\"pass through\")
  finally
    WriteLn(\"cleanup\")
  end
end

def Main()
  try
    f()
  except Exception
    WriteLn(\"caught\")
  end
end
";
    let (outcome, out) = run("finally_unwind.tn", src);
    assert_eq!(outcome, Outcome::Finished);
    assert_eq!(out, "cleanup\ncaught\n");
}

#[test]
fn break_travels_through_the_finally_block() {
    let src = "\
def Main()
  var i = 0
  while i < 10
    try
      if i == 2
        break
      end
      i = i + 1
    finally
      WriteLn(\"fin\")
    end
  end
  WriteLn(i)
end
";
    let (outcome, out) = run("break_finally.tn", src);
    assert_eq!(outcome, Outcome::Finished);
    assert_eq!(out, "fin\nfin\nfin\n2\n");
}

#[test]
fn classes_construct_with_member_initializers_and_create() {
    let src = "\
class Point
  var x = 0
  var y = 0

  def create(nx, ny)
    x = nx
    y = ny
  end

  def sum()
    return x + y
  end
end

def Main()
  var p = Point(3, 4)
  WriteLn(p.sum())
  WriteLn(p.x)
  p.x = 10
  WriteLn(p.sum())
end
";
    let (outcome, out) = run("classes.tn", src);
    assert_eq!(outcome, Outcome::Finished);
    assert_eq!(out, "7\n3\n14\n");
}

#[test]
fn inherited_methods_and_super_calls_dispatch_correctly() {
    let src = "\
class Animal
  var name = \"animal\"

  def speak()
    return \"...\"
  end

  def describe()
    return self.speak()
  end
end

class Dog is Animal
  def speak()
    return \"woof\"
  end

  def loud()
    return super.speak() + \"!\"
  end
end

def Main()
  var d = Dog()
  WriteLn(d.describe())
  WriteLn(d.loud())
end
";
    let (outcome, out) = run("inherit.tn", src);
    assert_eq!(outcome, Outcome::Finished);
    assert_eq!(out, "woof\n...!\n");
}

#[test]
fn getters_and_setters_shadow_member_access() {
    let src = "\
class Celsius
  var degrees = 0

  def fahrenheit
    return degrees * 9 div 5 + 32
  end

  def fahrenheit = value
    degrees = (value - 32) * 5 div 9
  end
end

def Main()
  var c = Celsius()
  c.fahrenheit = 212
  WriteLn(c.degrees)
  WriteLn(c.fahrenheit)
end
";
    let (outcome, out) = run("accessors.tn", src);
    assert_eq!(outcome, Outcome::Finished);
    assert_eq!(out, "100\n212\n");
}

#[test]
fn for_loops_desugar_to_the_iterator_protocol() {
    let src = "\
def Main()
  for i in 0 to 3
    WriteLn(i)
  end
  for v in [\"a\", \"b\"]
    WriteLn(v)
  end
end
";
    let (outcome, out) = run("for.tn", src);
    assert_eq!(outcome, Outcome::Finished);
    assert_eq!(out, "0\n1\n2\na\nb\n");
}

#[test]
fn switch_selects_by_equality() {
    let src = "\
def pick(n)
  switch n
  case 1, 2
    return \"low\"
  case 3
    return \"three\"
  else
    return \"other\"
  end
end

def Main()
  WriteLn(pick(2))
  WriteLn(pick(3))
  WriteLn(pick(9))
end
";
    let (outcome, out) = run("switch.tn", src);
    assert_eq!(outcome, Outcome::Finished);
    assert_eq!(out, "low\nthree\nother\n");
}

#[test]
fn arithmetic_promotes_and_compares() {
    let src = "\
def Main()
  WriteLn(2 ** 40)
  WriteLn(7 div 2)
  WriteLn(7 mod 3)
  WriteLn(1 < 2 and 2 < 3)
  WriteLn(\"ab\" + \"cd\")
  WriteLn(not 1 == 2)
end
";
    let (outcome, out) = run("arith.tn", src);
    assert_eq!(outcome, Outcome::Finished);
    assert_eq!(out, "1099511627776\n3\n1\nTrue\nabcd\nTrue\n");
}

#[test]
fn exit_carries_the_requested_code() {
    let (outcome, _) = run("exit.tn", "def Main()\n  Exit(7)\nend\n");
    assert_eq!(outcome, Outcome::ExitRequested(7));
}

#[test]
fn main_receives_the_program_arguments() {
    let src = "\
def Main(args)
  for a in args
    WriteLn(a)
  end
end
";
    let (outcome, out) = run_with_args("args.tn", src, &["one", "two"]);
    assert_eq!(outcome, Outcome::Finished);
    assert_eq!(out, "one\ntwo\n");
}

#[test]
fn allocation_pressure_survives_minor_collections() {
    // Builds far more short-lived garbage than the nursery holds; the
    // survivors must stay intact through repeated collections.
    let src = "\
def Main()
  var keep = []
  var i = 0
  while i < 3000
    var s = \"item\" + Str(i)
    if i mod 100 == 0
      keep.append(s)
    end
    i = i + 1
  end
  WriteLn(keep.length())
  WriteLn(keep[0])
  WriteLn(keep[29])
end
";
    let (outcome, out) = run("gc_pressure.tn", src);
    assert_eq!(outcome, Outcome::Finished);
    assert_eq!(out, "30\nitem0\nitem2900\n");
}

#[test]
fn forced_collection_keeps_reachable_data() {
    let src = "\
def Main()
  var data = [1, 2, 3]
  CollectGarbage()
  WriteLn(data.length())
  WriteLn(data[2])
end
";
    let (outcome, out) = run("gc_forced.tn", src);
    assert_eq!(outcome, Outcome::Finished);
    assert_eq!(out, "3\n3\n");
}

#[test]
fn operator_methods_dispatch_on_instances() {
    let src = "\
class Vec
  var x = 0

  def create(n)
    x = n
  end

  def _add(other)
    return Vec(x + other.x)
  end

  def _eq(other)
    return x == other.x
  end
end

def Main()
  var a = Vec(2)
  var b = Vec(3)
  var c = a + b
  WriteLn(c.x)
  WriteLn(c == Vec(5))
end
";
    let (outcome, out) = run("opmethods.tn", src);
    assert_eq!(outcome, Outcome::Finished);
    assert_eq!(out, "5\nTrue\n");
}

#[test]
fn strings_index_and_slice() {
    let src = "\
def Main()
  var s = \"hello\"
  WriteLn(s[1])
  WriteLn(s[1 to 4])
  WriteLn(s.length())
  WriteLn(\"ell\" in s)
end
";
    let (outcome, out) = run("strings.tn", src);
    assert_eq!(outcome, Outcome::Finished);
    assert_eq!(out, "e\nell\n5\nTrue\n");
}

#[test]
fn anonymous_function_frames_are_filtered_from_tracebacks() {
    let src = "\
def trigger()
  var boom = def ()
    raise ValueError(\"from inside\")
  end
  boom()
end

def Main()
  trigger()
end
";
    let (outcome, _) = run("anon_traceback.tn", src);
    match outcome {
        Outcome::Uncaught(rendered) => {
            assert!(
                !rendered.contains("anonymous function"),
                "anonymous frame leaked into: {rendered}"
            );
            assert!(rendered.contains("trigger"));
            assert!(rendered.contains("Main"));
            assert!(rendered.contains("ValueError: from inside"));
        }
        other => panic!("expected uncaught, got {other:?}"),
    }
}

#[test]
fn uncaught_exceptions_render_a_traceback_with_lines() {
    let src = "\
def inner()
  raise ValueError(\"deep\")
end

def outer()
  inner()
end

def Main()
  outer()
end
";
    let (outcome, _) = run("traceback.tn", src);
    match outcome {
        Outcome::Uncaught(rendered) => {
            assert!(rendered.contains("inner"));
            assert!(rendered.contains("outer"));
            assert!(rendered.contains("Main"));
            assert!(rendered.contains("line 2"));
            assert!(rendered.contains("ValueError: deep"));
        }
        other => panic!("expected uncaught, got {other:?}"),
    }
}
