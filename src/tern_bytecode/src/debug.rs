//! Symbolic dumps of compiled functions and programs.

use std::fmt::Write as _;

use crate::function::FunctionCode;
use crate::opcode::{CodeWord, Opcode, NO_TARGET};
use crate::program::Program;
use crate::exceptions::HandlerKind;

pub fn dump_program(program: &Program) -> String {
    let mut s = String::new();
    let _ = writeln!(
        &mut s,
        "Program: {} functions, {} types, entry #{}",
        program.functions.len(),
        program.types.len(),
        program.entry.0
    );
    for (i, f) in program.functions.iter().enumerate() {
        let _ = writeln!(&mut s);
        let _ = writeln!(&mut s, "fn #{i}:");
        s.push_str(&dump_function(f));
    }
    s
}

pub fn dump_function(f: &FunctionCode) -> String {
    let mut s = String::new();
    let vararg = if f.is_vararg() { ", varargs" } else { "" };
    let _ = writeln!(
        &mut s,
        "{} (args {}..{}{}, frame {})",
        f.name,
        f.min_args,
        f.max_positional(),
        vararg,
        f.frame_size
    );
    let mut offset = 0usize;
    while offset < f.code.len() {
        let len = Opcode::instruction_len(&f.code, offset);
        s.push_str(&format!("  {:4}: ", offset));
        s.push_str(&dump_instruction(&f.code[offset..offset + len]));
        s.push('\n');
        offset += len;
    }
    if !f.exceptions.is_empty() {
        let _ = writeln!(&mut s, "  exception descriptors:");
        for e in &f.exceptions.entries {
            let desc = match &e.kind {
                HandlerKind::BeginTry { direct } => {
                    format!("try{}", if *direct { " (direct)" } else { "" })
                }
                HandlerKind::Except {
                    slot,
                    handler,
                    caught_global,
                } => format!("except slot={slot} handler={handler} type=g{caught_global}"),
                HandlerKind::Finally { slot, handler } => {
                    format!("finally slot={slot} handler={handler}")
                }
            };
            let _ = writeln!(
                &mut s,
                "    [{}..{}) ctx={} {}",
                e.start, e.end, e.ctx_depth, desc
            );
        }
    }
    if !f.lines.is_empty() {
        let _ = writeln!(&mut s, "  lines:");
        for (offset, line) in f.lines.entries() {
            let _ = writeln!(&mut s, "    {offset} -> line {line}");
        }
    }
    s
}

pub fn dump_instruction(words: &[CodeWord]) -> String {
    let op = match Opcode::try_from(words[0]) {
        Ok(op) => op,
        Err(_) => return format!("<bad opcode {}>", words[0]),
    };
    let mut s = op.mnemonic().to_string();
    match op {
        Opcode::AssignInt => {
            let _ = write!(&mut s, " r{}, {}", words[1], words[2] as i32);
        }
        Opcode::LeaveFinally => {
            let target = if words[3] == NO_TARGET {
                "-".to_string()
            } else {
                words[3].to_string()
            };
            let _ = write!(&mut s, " r{}, pops {}, break {}", words[1], words[2], target);
        }
        _ => {
            for w in &words[1..] {
                let _ = write!(&mut s, " {w}");
            }
        }
    }
    s
}
