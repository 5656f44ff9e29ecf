use mprof::symbolization::{BinarySymbols, NameResolver, Symbolizer};

#[test]
fn test_symbolizer_creation() {
    let binary_path = env!("CARGO_BIN_EXE_mprof");

    let symbolizer = Symbolizer::new(binary_path);
    assert!(symbolizer.is_ok(), "Failed to create symbolizer: {:?}", symbolizer.err());
}

#[test]
fn test_symbolizer_rejects_non_binary() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("not-a-binary");
    std::fs::write(&path, b"plain text").unwrap();

    assert!(Symbolizer::new(&path).is_err());
    assert!(Symbolizer::new(dir.path().join("missing")).is_err());
}

#[test]
fn test_symbolizer_resolves_function_names() {
    let binary_path = env!("CARGO_BIN_EXE_mprof");
    let symbolizer = Symbolizer::new(binary_path).expect("Failed to create symbolizer");

    // Function addresses from nm; skip quietly where binutils is missing
    let Ok(nm_output) = std::process::Command::new("nm").args(["-C", binary_path]).output() else {
        return;
    };
    let symbols = String::from_utf8_lossy(&nm_output.stdout);

    let mut resolved = 0;
    for line in symbols.lines().filter(|l| l.contains(" T ")).take(20) {
        let Some(addr) = line.split_whitespace().next().and_then(|a| u64::from_str_radix(a, 16).ok()) else {
            continue;
        };
        let frame = symbolizer.resolve(addr);
        if frame.is_known() {
            assert!(!frame.frames[0].function.is_empty());
            assert!(frame.describe().starts_with(&format!("{addr:#x} ")));
            resolved += 1;
        }
    }
    assert!(resolved > 0 || symbols.is_empty(), "no text symbol resolved");
}

#[test]
fn test_binary_symbols_apply_load_base() {
    let binary_path = env!("CARGO_BIN_EXE_mprof");
    let symbolizer = Symbolizer::new(binary_path).unwrap();
    let direct = (0x1000..0x200000).step_by(0x40).find_map(|a| symbolizer.function_name(a).map(|n| (a, n)));
    let Some((addr, name)) = direct else {
        return;
    };

    let symbols = BinarySymbols::new(Symbolizer::new(binary_path).unwrap(), 0x5555_0000_0000);

    assert_eq!(symbols.name_of(0x5555_0000_0000 + addr as usize), Some(name));
    assert_eq!(symbols.name_of(0x1000), None);
}
