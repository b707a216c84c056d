use criterion::Criterion;
use field_psf::{Jacobian, PsfConfig, PsfFitter, StarData};
use field_psf_test_util::{NOISE, gaussian_catalog, grid_positions};
use std::hint::black_box;

pub fn bench_solve(c: &mut Criterion) {
    let stars: Vec<_> = gaussian_catalog(&grid_positions(8, 8), NOISE, 0)
        .into_iter()
        .map(|arrays| {
            StarData::new(
                arrays.image,
                arrays.weight,
                arrays.image_pos,
                arrays.field_pos,
                Jacobian::pixel_scale(arrays.pixel_scale),
            )
            .unwrap()
        })
        .collect();

    for num_workers in [1, 4] {
        let fitter = PsfFitter::new(
            PsfConfig::default()
                .with_reserve_frac(0.1)
                .with_num_workers(num_workers),
        )
        .unwrap();
        c.bench_function(&format!("Solve 64 stars, {num_workers} workers"), |b| {
            b.iter(|| fitter.solve(black_box(&stars)));
        });
    }
}
