use datatest_stable as datatest;
use std::path::Path;

use sable::lang::compile_file;

fn run_case(path: &Path) -> datatest::Result<()> {
    let name = path.file_name().and_then(|s| s.to_str()).unwrap_or_default();
    // Helper units are only compiled through the programs that import them.
    if name.starts_with("lib_") {
        return Ok(());
    }
    let expect_failure = name.starts_with("fail_");

    match compile_file(path) {
        Ok(_) if expect_failure => {
            Err(format!("{} compiled but was expected to fail", path.display()).into())
        }
        Ok(comp) => {
            let asm = comp.output();
            let text = asm
                .split_once("section .text\n")
                .map(|(_, text)| text)
                .ok_or("missing text section")?;
            if !text.contains("\n$main:\n") {
                return Err(format!("{}: no main subroutine\n{asm}", path.display()).into());
            }
            Ok(())
        }
        Err(_) if expect_failure => Ok(()),
        Err(e) => Err(format!("{}: {e}", path.display()).into()),
    }
}

datatest::harness! {
    { test = run_case, root = "./demos", pattern = r#"^.*\.sb$"# },
}
