//! Property-level checks over the compiler's observable guarantees:
//! deterministic output, scoping failures, frame-size arithmetic, literal
//! encodings, and the error-code algebra.

use flapc::codegen::rodata::{decode_values, encode_list, encode_string};
use flapc::resolver::{self, MAIN_FRAME};
use flapc::types::{ERR_DIV0, ERR_INDEX, ErrorCode, is_error_bits};
use flapc::{CompilerConfig, ErrorKind, Parser, Target};

fn config() -> CompilerConfig {
    CompilerConfig::default().with_target(Target::parse("amd64-linux").unwrap())
}

fn resolve(source: &str) -> resolver::ResolvedProgram {
    let mut program = Parser::new(source).unwrap().parse().unwrap();
    resolver::resolve(&mut program, &config()).unwrap()
}

fn resolve_err(source: &str) -> ErrorKind {
    let mut program = Parser::new(source).unwrap().parse().unwrap();
    resolver::resolve(&mut program, &config()).unwrap_err().kind
}

// ---- scoping ----

#[test]
fn test_every_mutable_redefine_is_a_shadow_error() {
    for source in [
        "x = 1\nx := 2",
        "x := 1\nx := 2",
        "x = 1\nf = () => { x := 2 }",
        "loud = 1\nLOUD := 2", // case-insensitive
        "x = 1\n{ x := 2 }",
    ] {
        assert_eq!(resolve_err(source), ErrorKind::Shadow, "source: {}", source);
    }
}

#[test]
fn test_every_bad_update_is_immutable_or_not_defined() {
    assert_eq!(resolve_err("x = 1\nx <- 2"), ErrorKind::Immutable);
    assert_eq!(resolve_err("x = 1\nx += 2"), ErrorKind::Immutable);
    assert_eq!(resolve_err("y <- 2"), ErrorKind::NotDefined);
    assert_eq!(resolve_err("y %= 2"), ErrorKind::NotDefined);
}

// ---- frame arithmetic ----

#[test]
fn test_frame_size_lower_bound_holds_for_every_frame() {
    let resolved = resolve(
        "a = 1\nb := 2\n\
         f = (p, q) => { r = p + q\ns = r * 2\ns }\n\
         g = (h, rest...) => h + #rest\n\
         k = 3\ncap = x => x + k\n\
         z = f(1, 2) + g(3, 4, 5) + cap(6)",
    );
    for (id, frame) in &resolved.frames {
        let named = frame.named_slots;
        assert!(
            frame.frame_size >= 16 * named,
            "frame {} too small: {} < 16*{}",
            id,
            frame.frame_size,
            named
        );
        assert_eq!(frame.frame_size % 16, 0, "frame {} misaligned", id);
        // Slots are 16-byte aligned and unique
        let mut offsets: Vec<i32> = frame.slots.values().map(|s| s.offset).collect();
        offsets.sort();
        let before = offsets.len();
        offsets.dedup();
        assert_eq!(before, offsets.len(), "frame {} reuses a slot", id);
        for off in offsets {
            assert_eq!(off % 16, 0);
            assert!(off < 0);
        }
    }
}

#[test]
fn test_captures_sit_after_params() {
    let resolved = resolve("k = 5\nadd = (a, b) => a + b + k\nz = add(1, 2)");
    let lambda = resolved
        .frames
        .iter()
        .find(|(id, _)| **id != MAIN_FRAME)
        .map(|(_, f)| f)
        .unwrap();
    assert_eq!(lambda.params.len(), 2);
    assert_eq!(lambda.captures.len(), 1);
    // params at -16, -32; capture next
    assert_eq!(lambda.captures[0].offset, -48);
}

// ---- literal encodings (the layout FFI and helpers rely on) ----

#[test]
fn test_string_encoding_roundtrip_any_literal() {
    for s in ["", "a", "Hello, World!", "ünïcödé", "tabs\tand\nnewlines"] {
        let bytes = encode_string(s);
        let n = f64::from_le_bytes(bytes[0..8].try_into().unwrap()) as usize;
        assert_eq!(n, s.chars().count());
        assert_eq!(bytes.len(), 8 + 16 * n);
        let back: String = decode_values(&bytes)
            .iter()
            .map(|v| char::from_u32(*v as u32).unwrap())
            .collect();
        assert_eq!(back, s);
    }
}

#[test]
fn test_list_entries_read_back_in_order() {
    let values = [10.0, 20.0, 30.0, -1.5, 0.0];
    let bytes = encode_list(&values);
    assert_eq!(decode_values(&bytes), values.to_vec());
    // keys are sequential from 0
    for (i, _) in values.iter().enumerate() {
        let at = 8 + 16 * i;
        let key = f64::from_le_bytes(bytes[at..at + 8].try_into().unwrap());
        assert_eq!(key, i as f64);
    }
}

// ---- error-code algebra backing or! ----

#[test]
fn test_error_bits_never_collide_with_values() {
    // plain numbers
    for v in [0.0f64, 1.0, -1.0, 10.0, 1e300, f64::MIN_POSITIVE] {
        assert!(!is_error_bits(v.to_bits()), "{} misread as error", v);
    }
    // plausible heap pointers
    for p in [0x40_1000u64, 0x7f00_dead_be00, (1u64 << 47) - 16] {
        assert!(!is_error_bits(p));
    }
    // real errors are errors
    assert!(is_error_bits(ERR_DIV0.to_bits()));
    assert!(is_error_bits(ERR_INDEX.to_bits()));
}

#[test]
fn test_error_code_decode_is_exact() {
    let bits = ERR_DIV0.to_bits();
    assert_eq!(ErrorCode::from_bits(bits).unwrap().as_str(), "dv0 ");
    // the encoding is a NaN, so arithmetic on it stays poisoned
    assert!(f64::from_bits(bits).is_nan());
    assert!((f64::from_bits(bits) + 1.0).is_nan());
}

// ---- whole-pipeline determinism ----

#[test]
fn test_determinism_across_feature_mix() {
    let source = r#"
base = 2
pow2 = n => base ** n
table := [0, 0, 0, 0]
@@ i in 0..<4 { table[i] <- i }
sum := 0
@ i in 0..<4 max 100 { sum <- sum + table[i] }
label = sum { 6 -> "six" ~> f"{sum}" }
println(label)
println(pow2(10))
"#;
    let cfg = config();
    let a = flapc::compile_source(source, std::path::Path::new("p.flap"), &cfg).unwrap();
    let b = flapc::compile_source(source, std::path::Path::new("p.flap"), &cfg).unwrap();
    assert_eq!(a, b);
    assert!(!a.is_empty());
}
