//! Whole-pipeline compilation tests: diagnostics, recovery and the
//! shape of the emitted code.

use std::path::PathBuf;

use tern_parser::{CompileError, CompileOptions, Compiler};
use tern_syntax::DiagnosticCode;

fn write_temp(name: &str, src: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("tern_parser_tests");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, src).unwrap();
    path
}

fn compile(name: &str, src: &str) -> (Compiler, Result<tern_bytecode::Program, CompileError>) {
    let path = write_temp(name, src);
    let mut compiler = Compiler::new(CompileOptions::default());
    let result = compiler.compile_file(&path);
    (compiler, result)
}

#[test]
fn minimal_function_compiles_with_exact_arity() {
    let (_, result) = compile(
        "minimal.tn",
        "def Main()\n  var x = 1\nend\n",
    );
    let program = result.expect("compiles");
    let main = program
        .functions
        .iter()
        .find(|f| f.name == "Main")
        .expect("Main exists");
    assert_eq!(main.min_args, 0);
    assert_eq!(main.max_args, 0);
}

#[test]
fn duplicate_method_reports_one_error_at_the_second_definition() {
    let src = "\
class C
  def m()
  end
  def m()
  end
end
def Main()
end
";
    let (compiler, result) = compile("dup_method.tn", src);
    assert!(result.is_err());
    let redefs: Vec<_> = compiler
        .diags
        .diagnostics
        .iter()
        .filter(|d| d.code == DiagnosticCode::Redefined)
        .collect();
    assert_eq!(redefs.len(), 1);
    // The error points at the second `m`.
    assert_eq!(redefs[0].line, 4);
}

#[test]
fn supertype_cycle_reports_once_and_leaves_supers_unset() {
    let src = "\
class A is B
end
class B is A
end
def Main()
end
";
    let (compiler, result) = compile("cycle.tn", src);
    assert!(result.is_err());
    let cycles: Vec<_> = compiler
        .diags
        .diagnostics
        .iter()
        .filter(|d| d.code == DiagnosticCode::CycleInSupertype)
        .collect();
    assert_eq!(cycles.len(), 1);
    // Both classes keep their supertype unset.
    for tid in compiler.types.ids() {
        assert!(compiler.types.get(tid).resolved_super().is_none());
    }
}

#[test]
fn undefined_name_is_reported_once_per_symbol() {
    let src = "\
def Main()
  var a = missing
  var b = missing
end
";
    let (compiler, result) = compile("undefined.tn", src);
    assert!(result.is_err());
    let undefined: Vec<_> = compiler
        .diags
        .diagnostics
        .iter()
        .filter(|d| d.code == DiagnosticCode::UndefinedName)
        .collect();
    assert_eq!(undefined.len(), 1);
}

#[test]
fn swap_uses_one_stack_slot_per_destination() {
    let src = "\
def Main()
  var a, b = 1, 2
  a, b = b, a
end
";
    let (_, result) = compile("swap.tn", src);
    let program = result.expect("compiles");
    let main = program
        .functions
        .iter()
        .find(|f| f.name == "Main")
        .unwrap();
    // Two named locals plus at most one temporary per destination.
    assert!(main.frame_size <= 4, "frame is {}", main.frame_size);
    // The peepholed element-by-element form emits no array constructor.
    let has_create_array = {
        use tern_bytecode::Opcode;
        let mut found = false;
        let mut i = 0;
        while i < main.code.len() {
            if main.code[i] == Opcode::CreateArray as u32 {
                found = true;
            }
            i += Opcode::instruction_len(&main.code, i);
        }
        found
    };
    assert!(!has_create_array);
}

#[test]
fn break_pop_counts_are_patched_by_the_enclosing_finally() {
    // A break inside try/finally must jump through the finally block.
    let src = "\
def Main()
  while 1 == 1
    try
      break
    finally
      var x = 1
    end
  end
end
";
    let (_, result) = compile("break_finally.tn", src);
    let program = result.expect("compiles");
    let main = program
        .functions
        .iter()
        .find(|f| f.name == "Main")
        .unwrap();
    use tern_bytecode::{HandlerKind, Opcode};
    let finally = main
        .exceptions
        .entries
        .iter()
        .find_map(|e| match e.kind {
            HandlerKind::Finally { handler, .. } => Some(handler),
            _ => None,
        })
        .expect("finally descriptor present");
    // Find the break's jump: a Jmp whose target is the finally handler.
    let mut found = false;
    let mut i = 0;
    while i < main.code.len() {
        if main.code[i] == Opcode::Jmp as u32 && main.code[i + 1] == finally {
            found = true;
        }
        i += Opcode::instruction_len(&main.code, i);
    }
    assert!(found, "break jump bound to the finally handler");
}

#[test]
fn member_tables_hold_at_most_a_getter_setter_pair_per_key() {
    let src = "\
class Thing
  var a = 1
  const b = 2

  def m()
  end

  def c
    return 3
  end

  def c = value
    a = value
  end
end
def Main()
end
";
    let (_, result) = compile("member_tables.tn", src);
    let program = result.expect("compiles");
    use tern_bytecode::MemberTableKind;
    for tid in program.types.ids() {
        let t = program.types.get(tid);
        for key in 0..program.member_names.len() as u32 {
            let entries = t.entries_for_key(tern_syntax::MemberId(key));
            assert!(
                entries.len() <= 2,
                "{}: member {} has {} entries",
                t.name,
                key,
                entries.len()
            );
            if entries.len() == 2 {
                let kinds: Vec<_> = entries.iter().map(|(k, _)| *k).collect();
                assert!(kinds.iter().all(|k| matches!(
                    k,
                    MemberTableKind::GetterPublic
                        | MemberTableKind::GetterPrivate
                        | MemberTableKind::SetterPublic
                        | MemberTableKind::SetterPrivate
                )));
            }
        }
    }
    // The supertype invariant holds across every resolved type.
    for tid in program.types.ids() {
        let t = program.types.get(tid);
        if let Some(sup) = t.resolved_super() {
            assert_eq!(
                t.total_num_vars,
                t.num_vars + program.types.get(sup).total_num_vars
            );
        }
    }
}

#[test]
fn module_imports_resolve_through_the_search_path() {
    let dir = std::env::temp_dir().join("tern_parser_tests/modsearch");
    let module_dir = dir.join("util");
    std::fs::create_dir_all(&module_dir).unwrap();
    std::fs::write(module_dir.join("util.tn"), "def Helper()\n  return 5\nend\n").unwrap();
    let main_path = dir.join("main.tn");
    std::fs::write(
        &main_path,
        "import util\ndef Main()\n  var v = util::Helper()\nend\n",
    )
    .unwrap();

    let mut compiler = Compiler::new(CompileOptions::default());
    let result = compiler.compile_file(&main_path);
    assert!(
        result.is_ok(),
        "diagnostics: {}",
        compiler.diags.render()
    );
}

#[test]
fn missing_module_is_a_diagnostic_not_a_crash() {
    let (compiler, result) = compile(
        "missing_module.tn",
        "import nonexistent\ndef Main()\nend\n",
    );
    assert!(result.is_err());
    assert!(compiler
        .diags
        .diagnostics
        .iter()
        .any(|d| d.code == DiagnosticCode::ModuleNotFound));
}
