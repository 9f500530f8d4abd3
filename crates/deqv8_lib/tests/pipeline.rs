use deqv8_lib::{DecompileOptions, Decompiler, OutputFormat, decompile, decompile_with_options};
use pretty_assertions::assert_eq;
use test_case::test_case;

fn dump(body: &str) -> String {
    format!(
        "Start SharedFunctionInfo\n0x10: [SharedFunctionInfo] in OldSpace\n{body}End SharedFunctionInfo\n"
    )
}

const IDENTITY: &str = "\
Parameter count 2
Register count 0
Constant pool (size = 0)
Handler Table (size = 0)
         0x100 @    0 : 0b 03             Ldar a0
         0x102 @    2 : aa                Return
";

#[test]
fn identity_function() {
    let out = decompile(&dump(IDENTITY));
    assert_eq!(out, "function func_start_0x10(a0)\n{\n\tACCU = a0\n\treturn ACCU\n}\n");
}

#[test]
fn all_sections_are_labelled() {
    let options = DecompileOptions {
        format: OutputFormat::parse_list("v8_opcode,translated,decompiled").unwrap(),
        source_name: Some("identity.txt".to_string()),
    };
    let out = decompile_with_options(&dump(IDENTITY), options);
    let expected = "function func_start_0x10(a0)\n\
        // raw\n\
        @ 0 : 0b 03 Ldar a0\n\
        @ 1 :  // placeholder\n\
        @ 2 : aa Return\n\
        // translated\n\
        {\n\
        \tACCU = a0\n\
        \treturn ACCU\n\
        }\n\
        // decompiled\n\
        {\n\
        \tACCU = a0\n\
        \treturn ACCU\n\
        }\n";
    assert_eq!(out, expected);
}

#[test]
fn fixed_array_constant_is_inlined() {
    let text = format!(
        "Start FixedArray\n0x40: [FixedArray] in OldSpace\n - map: 0x1 <Map>\n - length: 3\n           0: 1\n         1-2: 2\nEnd FixedArray\n{}",
        dump(
            "Parameter count 1\nRegister count 0\nConstant pool (size = 1)\n0: 0x40 <FixedArray[3]>\nHandler Table (size = 0)\n\
             0x100 @    0 : 7a 00 00 25       CreateArrayLiteral [0], [0], #37\n\
             0x104 @    4 : aa                Return\n"
        )
    );
    assert_eq!(decompile(&text), "function func_start_0x10()\n{\n\treturn [1, 2, 2]\n}\n");
}

#[test]
fn conditional_branch_becomes_if_block() {
    let text = dump(
        "Parameter count 2\nRegister count 0\nHandler Table (size = 0)\n\
         0x100 @    0 : 0b 03             Ldar a0\n\
         0x102 @    2 : 99 06             JumpIfFalse [6] (0x108 @ 8)\n\
         0x104 @    4 : 0d 01             LdaSmi [1]\n\
         0x106 @    6 : aa                Return\n\
         0x108 @    8 : 0e                LdaUndefined\n\
         0x109 @    9 : aa                Return\n",
    );
    let expected = "function func_start_0x10(a0)\n\
        {\n\
        \tACCU = a0\n\
        \tif (ACCU)\n\
        \t{\n\
        \t\treturn 1\n\
        \t}\n\
        \treturn undefined\n\
        }\n";
    assert_eq!(decompile(&text), expected);
}

#[test]
fn loop_output_has_balanced_braces() {
    let text = dump(
        "Parameter count 1\nRegister count 1\nHandler Table (size = 0)\n\
         0x100 @    0 : 0c                LdaZero\n\
         0x101 @    1 : c4                Star0\n\
         0x102 @    2 : 0d 0a             LdaSmi [10]\n\
         0x104 @    4 : 6c fa 00          TestLessThan r0, [0]\n\
         0x107 @    7 : 99 0a             JumpIfFalse [10] (0x111 @ 17)\n\
         0x109 @    9 : 0b fa             Ldar r0\n\
         0x10b @   11 : 50 01             AddSmi [1], [1]\n\
         0x10d @   13 : c4                Star0\n\
         0x10e @   14 : 8a 0c 00          JumpLoop [12], [0] (0x102 @ 2)\n\
         0x111 @   17 : 0b fa             Ldar r0\n\
         0x113 @   19 : aa                Return\n",
    );
    let out = decompile(&text);
    assert_eq!(out.matches('{').count(), out.matches('}').count(), "{out}");
    assert!(out.contains("while (true)"), "{out}");
    assert!(out.contains("break"), "{out}");
}

const NESTED: &str = "\
Start SharedFunctionInfo
0x10: [SharedFunctionInfo] in OldSpace
 - scope info: 0x40
Parameter count 1
Register count 0
Constant pool (size = 1)
0: 0x20 <SharedFunctionInfo inner>
Start SharedFunctionInfo
0x20: [SharedFunctionInfo] in OldSpace
 - outer scope info: 0x40
Parameter count 1
Register count 0
Constant pool (size = 0)
Handler Table (size = 0)
         0x200 @    0 : 17 02             LdaImmutableCurrentContextSlot [2]
         0x202 @    2 : aa                Return
End SharedFunctionInfo
Handler Table (size = 0)
         0x100 @    0 : 0d 05             LdaSmi [5]
         0x102 @    2 : 25 02             StaCurrentContextSlot [2]
         0x104 @    4 : 80 00 00 02       CreateClosure [0], [0], #2
         0x108 @    8 : aa                Return
End SharedFunctionInfo
";

#[test]
fn nested_function_reads_declarer_slot() {
    let mut decompiler = Decompiler::new(DecompileOptions::default());
    let (out, summary) = decompiler.run(NESTED);
    assert_eq!(summary.parsed, 2);
    assert_eq!(summary.decompiled, 2);
    assert_eq!(summary.failed, 0);

    let inner = decompiler.context().function("func_inner_0x20").unwrap();
    assert_eq!(inner.declarer.as_deref(), Some("func_start_0x10"));

    let expected = "function func_inner_0x20()\n{\n\treturn 5\n}\n\
        \n\
        function func_start_0x10()\n{\n\tScope[1][2] = 5\n\tACCU = func_inner_0x20\n\treturn ACCU\n}\n";
    assert_eq!(out, expected);
}

#[test_case("", &[] ; "empty pool")]
#[test_case("0: 0x1 <Odd Oddball: null>\n", &["null", "", ""] ; "short pool is padded")]
#[test_case("0-2: 7\n", &["7", "7", "7"] ; "range fills every slot")]
#[test_case("0: 0x2 <String[1]: #a>\n1: 0x3 <ObjectBoilerplateDescription[3]>\n2: 0x4 <SharedFunctionInfo later>\n",
    &["\"a\"", "{}", "func_ref_later"] ; "mixed entries")]
fn constant_pool_has_declared_length(entries: &str, expected: &[&str]) {
    let size = if entries.is_empty() { 0 } else { 3 };
    let text = dump(&format!(
        "Parameter count 1\nConstant pool (size = {size})\n{entries}Handler Table (size = 0)\n         0x100 @    0 : aa                Return\n"
    ));
    let mut decompiler = Decompiler::new(DecompileOptions::default());
    decompiler.run(&text);
    let pool = &decompiler.context().function("func_start_0x10").unwrap().const_pool;
    assert_eq!(pool, expected);
}

#[test]
fn runs_are_deterministic() {
    let mut decompiler = Decompiler::new(DecompileOptions::default());
    let (first, _) = decompiler.run(NESTED);
    let (second, _) = decompiler.run(NESTED);
    assert_eq!(first, second);
    assert_eq!(first, decompile(NESTED));
}

#[test]
fn truncated_function_is_still_rendered() {
    let text = "Start SharedFunctionInfo\n0x10: [SharedFunctionInfo] in OldSpace\nParameter count 1\n\
                0x100 @    0 : aa                Return\n";
    let mut decompiler = Decompiler::new(DecompileOptions::default());
    let (out, summary) = decompiler.run(text);
    assert_eq!(summary.parsed, 1);
    assert_eq!(out, "function func_start_0x10()\n{\n\treturn ACCU\n}\n");
}

#[test]
fn branch_to_loop_body_tail_stays_if() {
    let text = dump(
        "Parameter count 2\nRegister count 5\nHandler Table (size = 0)\n\
         0x100 @    0 : 0b 03             Ldar a0\n\
         0x102 @    2 : 99 0c             JumpIfFalse [12] (0x10e @ 14)\n\
         0x104 @    4 : 0d 01             LdaSmi [1]\n\
         0x106 @    6 : 18 f9             Star r1\n\
         0x108 @    8 : 0d 02             LdaSmi [2]\n\
         0x10a @   10 : 18 f8             Star r2\n\
         0x10c @   12 : 18 f7             Star r3\n\
         0x10e @   14 : 0b f9             Ldar r1\n\
         0x110 @   16 : 18 f6             Star r4\n\
         0x114 @   20 : 8a 14 00          JumpLoop [20], [0] (0x100 @ 0)\n\
         0x117 @   23 : 0e                LdaUndefined\n\
         0x118 @   24 : aa                Return\n",
    );
    let out = decompile(&text);
    assert!(out.contains("while (true)"), "{out}");
    assert!(out.contains("if (ACCU)"), "{out}");
    assert!(!out.contains("continue"), "{out}");
    assert_eq!(out.matches('{').count(), out.matches('}').count(), "{out}");
}

#[test]
fn oversized_constant_pool_skips_one_function() {
    let text = "Start SharedFunctionInfo\n0x10: [SharedFunctionInfo] in OldSpace\nParameter count 1\n\
                Constant pool (size = 1000000000000000)\n0: 7\nHandler Table (size = 0)\n\
                0x100 @    0 : aa                Return\nEnd SharedFunctionInfo\n\
                Start SharedFunctionInfo\n0x20: [SharedFunctionInfo] in OldSpace\nParameter count 1\n\
                Constant pool (size = 0)\nHandler Table (size = 0)\n\
                0x200 @    0 : 0d 02             LdaSmi [2]\n\
                0x202 @    2 : aa                Return\nEnd SharedFunctionInfo\n";
    let mut decompiler = Decompiler::new(DecompileOptions::default());
    let (out, summary) = decompiler.run(text);
    assert_eq!(summary.parsed, 2);
    assert!(out.contains("function func_start_0x20()\n{\n\treturn 2\n}\n"), "{out}");
}
