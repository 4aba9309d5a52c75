//! Disassembler output tests.

use tern_bytecode::debug::{dump_function, dump_instruction};
use tern_bytecode::{
    ExceptionRange, ExceptionTable, FileId, FunctionCode, HandlerKind, LineTable,
    LineTableBuilder, Opcode,
};

fn function_with(code: Vec<u32>) -> FunctionCode {
    FunctionCode {
        name: "f".to_string(),
        sym: None,
        code,
        min_args: 0,
        max_args: 0,
        num_hidden_args: 0,
        frame_size: 1,
        file: FileId(0),
        exceptions: ExceptionTable::default(),
        lines: LineTable::default(),
        synthetic: false,
    }
}

#[test]
fn instructions_decode_with_their_operands() {
    assert_eq!(
        dump_instruction(&[Opcode::AssignInt as u32, 0, (-7i32) as u32]),
        "assign_int r0, -7"
    );
    assert_eq!(
        dump_instruction(&[Opcode::CallGlobal as u32, 1, 42, 2, 3, 4]),
        "call_global 1 42 2 3 4"
    );
    assert_eq!(
        dump_instruction(&[Opcode::LeaveFinally as u32, 2, 1, 0x8000_0000]),
        "leave_finally r2, pops 1, break -"
    );
}

#[test]
fn functions_dump_code_descriptors_and_lines() {
    let mut lines = LineTableBuilder::new();
    lines.push(0, 3);
    let f = FunctionCode {
        code: vec![
            Opcode::AssignInt as u32,
            0,
            5,
            Opcode::RetLocal as u32,
            0,
        ],
        exceptions: ExceptionTable {
            entries: vec![ExceptionRange {
                start: 0,
                end: 3,
                ctx_depth: 0,
                kind: HandlerKind::Finally {
                    slot: 0,
                    handler: 5,
                },
            }],
        },
        lines: lines.build(),
        ..function_with(Vec::new())
    };
    let dump = dump_function(&f);
    assert!(dump.contains("f (args 0..0, frame 1)"));
    assert!(dump.contains("assign_int r0, 5"));
    assert!(dump.contains("ret_local 0"));
    assert!(dump.contains("finally slot=0 handler=5"));
    assert!(dump.contains("0 -> line 3"));
}

#[test]
fn empty_function_header_snapshot() {
    let f = function_with(Vec::new());
    insta::assert_snapshot!(dump_function(&f), @"f (args 0..0, frame 1)");
}
