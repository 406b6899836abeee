//! Graph algorithms built from joins: triangle counting and page rank.

use millrace::testing::run_local_test;
use millrace::equal_to_dia;

#[test]
fn triangle_count_on_k5() {
    run_local_test(|ctx| {
        // All directed edges (i, j) with i < j < 5.
        let mut edges = Vec::new();
        for i in 0u32..5 {
            for j in (i + 1)..5 {
                edges.push((i, j));
            }
        }
        let edges = equal_to_dia(ctx, edges).cache();

        // Paths a -> b -> c with a < b < c, then close the triangle with
        // the edge (a, c).
        let paths = edges.inner_join_with(
            &edges,
            |e: &(u32, u32)| e.1,
            |e: &(u32, u32)| e.0,
            |ab, bc| (ab.0, ab.1, bc.1),
        );
        let triangles = paths.inner_join_with(
            &edges,
            |p: &(u32, u32, u32)| (p.0, p.2),
            |e: &(u32, u32)| (e.0, e.1),
            |path, _closing| path,
        );
        assert_eq!(triangles.size()?, 10);
        Ok(())
    });
}

#[test]
fn page_rank_converges_to_the_reference() {
    const DAMPING: f64 = 0.85;
    const PAGES: usize = 4;
    const ITERATIONS: usize = 5;

    // Reference: the same iteration computed on plain vectors.
    let outlinks: Vec<Vec<usize>> = vec![vec![1, 2], vec![2], vec![0, 1], vec![0]];
    let mut reference = vec![1.0 / PAGES as f64; PAGES];
    for _ in 0..ITERATIONS {
        let mut next = vec![(1.0 - DAMPING) / PAGES as f64; PAGES];
        for (page, outs) in outlinks.iter().enumerate() {
            for &target in outs {
                next[target] += DAMPING * reference[page] / outs.len() as f64;
            }
        }
        reference = next;
    }

    run_local_test(move |ctx| {
        let links = equal_to_dia(
            ctx,
            vec![
                (0usize, vec![1usize, 2]),
                (1, vec![2]),
                (2, vec![0, 1]),
                (3, vec![0]),
            ],
        );
        let mut ranks = equal_to_dia(
            ctx,
            (0..PAGES).map(|p| (p, 1.0 / PAGES as f64)).collect(),
        )
        .collapse();

        for _ in 0..ITERATIONS {
            let contributions = links
                .inner_join_with(
                    &ranks,
                    |l: &(usize, Vec<usize>)| l.0,
                    |r: &(usize, f64)| r.0,
                    |l, r| (l.1, r.1),
                )
                .flat_map(|(outs, rank): (Vec<usize>, f64)| {
                    let share = rank / outs.len() as f64;
                    outs.into_iter().map(move |t| (t, share)).collect::<Vec<_>>()
                });
            ranks = contributions
                .group_to_index(
                    |c| c.0,
                    |page, contribs| {
                        let inbound: f64 = contribs.iter().map(|c| c.1).sum();
                        (page, (1.0 - DAMPING) / PAGES as f64 + DAMPING * inbound)
                    },
                    PAGES,
                )
                .collapse();
        }

        let mut out = ranks.all_gather()?;
        out.sort_by_key(|r| r.0);
        let reference = reference.clone();
        assert_eq!(out.len(), PAGES);
        for (page, rank) in out {
            assert!(
                (rank - reference[page]).abs() < 1e-6,
                "page {page}: {rank} vs reference {}",
                reference[page]
            );
        }
        Ok(())
    });
}
