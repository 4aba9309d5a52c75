//! Pass-1 scanner tests: the exposed-variable pass re-tags definition
//! tokens, never reference tokens, and annotation content never
//! triggers the marker.

use tern_parser::annotations::elide_annotations;
use tern_parser::scan::scan_file;
use tern_parser::{CompileOptions, Compiler, Lexer};
use tern_syntax::{Token, TokenKind, TokenPayload};

fn scan(src: &str) -> (Compiler, Vec<Token>) {
    let mut comp = Compiler::new(CompileOptions::default());
    let mut lexer = Lexer::new();
    let mut tokens = Vec::new();
    lexer.tokenize_block(&mut comp.symbols, src.as_bytes(), true, &mut tokens);
    elide_annotations(&mut tokens);
    scan_file(&mut comp, &mut tokens);
    (comp, tokens)
}

/// Definition tokens of `name` that were re-tagged as exposed.
fn exposed_tokens(comp: &Compiler, tokens: &[Token], name: &str) -> usize {
    tokens
        .iter()
        .filter(|t| {
            t.kind == TokenKind::IdentExposed
                && matches!(t.payload, TokenPayload::Symbol(s) if comp.symbols.name(s) == name)
        })
        .count()
}

#[test]
fn captured_local_definition_is_marked_exposed() {
    let src = "\
def f()
  var x = 10
  var g = def ()
    return x
  end
  x = 20
  return g()
end
";
    let (comp, tokens) = scan(src);
    // Exactly the defining token of x is re-tagged.
    assert_eq!(exposed_tokens(&comp, &tokens, "x"), 1);
    let def_token = tokens
        .iter()
        .position(|t| t.kind == TokenKind::IdentExposed)
        .unwrap();
    assert_eq!(tokens[def_token].line, 2);
}

#[test]
fn uncaptured_locals_stay_plain() {
    let src = "\
def f()
  var y = 1
  var g = def ()
    return 2
  end
  return y
end
";
    let (comp, tokens) = scan(src);
    assert_eq!(exposed_tokens(&comp, &tokens, "y"), 0);
}

#[test]
fn member_access_does_not_mark_a_local_exposed() {
    // `o.x` inside the anonymous function refers to a member, not the
    // outer local x.
    let src = "\
def f(o)
  var x = 1
  var g = def ()
    return o.x
  end
  return x
end
";
    let (comp, tokens) = scan(src);
    assert_eq!(exposed_tokens(&comp, &tokens, "x"), 0);
    // o itself is captured.
    assert_eq!(exposed_tokens(&comp, &tokens, "o"), 1);
}

#[test]
fn annotation_content_never_triggers_the_marker() {
    // The annotation names the outer local's spelling; annotation
    // tokens are re-kinded before the pass runs, so nothing is marked.
    let src = "\
def f()
  var Item = 1
  var g = def (a as Item)
    return a
  end
  return Item
end
";
    let (comp, tokens) = scan(src);
    assert_eq!(exposed_tokens(&comp, &tokens, "Item"), 0);
}

#[test]
fn for_loop_variables_can_be_exposed() {
    let src = "\
def f(items)
  for v in items
    var g = def ()
      return v
    end
  end
end
";
    let (comp, tokens) = scan(src);
    assert_eq!(exposed_tokens(&comp, &tokens, "v"), 1);
}

#[test]
fn except_binding_can_be_exposed() {
    let src = "\
def f()
  try
    var a = 1
  except e is Exception
    var g = def ()
      return e
    end
  end
end
";
    let (comp, tokens) = scan(src);
    assert_eq!(exposed_tokens(&comp, &tokens, "e"), 1);
}
