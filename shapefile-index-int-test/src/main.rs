use shapefile_index::{Envelope, Query, ShapefileConfig, ShapefileResult};
use shapefile_index_int_test::test_util::{
    cleanup, create_test_context_with, insert_points, random_points,
};

fn main() -> ShapefileResult<()> {
    colog::init();
    println!("Starting stress test...");
    let config = ShapefileConfig::builder()
        .max_qix_cache_size(256 * 1024 * 1024)
        .build();
    let ctx = create_test_context_with(config)?;
    let store = ctx.store();

    let count = 200_000;
    let points = random_points(2024, count, 1000.0);
    let start = std::time::Instant::now();
    insert_points(&store, &points)?;
    println!("Inserted {} points in {:?}", count, start.elapsed());

    let window = Query::bbox(Envelope::new(400.0, 400.0, 450.0, 450.0)).without_attributes();

    let start = std::time::Instant::now();
    let hits = store.count(&window)?;
    println!("First indexed query found {} in {:?} (includes build)", hits, start.elapsed());

    let start = std::time::Instant::now();
    for _ in 0..100 {
        store.count(&window)?;
    }
    println!("100 cached queries in {:?}", start.elapsed());

    let scan = ctx.reopen(ShapefileConfig::builder().scan_only_preset().build())?;
    let start = std::time::Instant::now();
    let scanned = scan.count(&window)?;
    println!("Full scan found {} in {:?}", scanned, start.elapsed());
    assert_eq!(hits, scanned);

    cleanup(ctx)
}
