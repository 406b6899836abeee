//! Line and binary file round trips through the VFS surface.

use millrace::testing::run_local_test;
use millrace::{generate_with, read_binary, read_lines};
use std::io::Write;

#[test]
fn read_lines_splits_files_across_workers() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut expected = Vec::new();
    for f in 0..3 {
        let path = dir.path().join(format!("input-{f}.txt"));
        let mut file = std::fs::File::create(&path)?;
        for l in 0..40 {
            let line = format!("file{f}-line{l:03}");
            writeln!(file, "{line}")?;
            expected.push(line);
        }
    }
    expected.sort();

    let pattern = dir.path().join("input-*.txt").display().to_string();
    run_local_test(move |ctx| {
        let lines = read_lines(ctx, &pattern)?;
        let mut out = lines.all_gather()?;
        out.sort();
        assert_eq!(out, expected);
        Ok(())
    });
    Ok(())
}

#[test]
fn write_lines_produces_one_global_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("out.txt").display().to_string();

    run_local_test(move |ctx| {
        let lines = generate_with(ctx, 20, |i| format!("line-{i:02}"));
        lines.write_lines(&path)?;
        if ctx.global_rank() == 0 {
            let written = std::fs::read_to_string(&path)?;
            let got: Vec<&str> = written.lines().collect();
            let expected: Vec<String> = (0..20).map(|i| format!("line-{i:02}")).collect();
            assert_eq!(got, expected);
        }
        Ok(())
    });
    Ok(())
}

#[test]
fn write_lines_many_produces_one_file_per_worker() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let base = dir.path().display().to_string();

    run_local_test(move |ctx| {
        let p = ctx.num_workers();
        let pattern = format!("{base}/p{p}/part-##.txt");
        let lines = generate_with(ctx, 33, |i| format!("row-{i}"));
        lines.write_lines_many(&pattern)?;
        ctx.flow().barrier()?;

        if ctx.global_rank() == 0 {
            let mut all = Vec::new();
            for w in 0..p {
                let path = format!("{base}/p{p}/part-{w:02}.txt");
                let content = std::fs::read_to_string(&path)?;
                all.extend(content.lines().map(str::to_string));
            }
            all.sort();
            let mut expected: Vec<String> = (0..33).map(|i| format!("row-{i}")).collect();
            expected.sort();
            assert_eq!(all, expected);
        }
        Ok(())
    });
    Ok(())
}

#[test]
fn binary_round_trip_restores_the_collection() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let base = dir.path().display().to_string();

    run_local_test(move |ctx| {
        let p = ctx.num_workers();
        let pattern = format!("{base}/p{p}/blocks-####.bin");
        let values = generate_with(ctx, 1234, |i| (i as u64, format!("payload-{i}")));
        values.write_binary(&pattern)?;
        // Every worker must have finished writing before anyone globs.
        ctx.flow().barrier()?;

        let restored = read_binary::<(u64, String)>(ctx, &format!("{base}/p{p}/blocks-*.bin"))?;
        assert_eq!(restored.size()?, 1234);
        let mut out = restored.all_gather()?;
        out.sort();
        for (i, (id, payload)) in out.into_iter().enumerate() {
            assert_eq!(id, i as u64);
            assert_eq!(payload, format!("payload-{i}"));
        }
        Ok(())
    });
    Ok(())
}
