use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shapefile_index::{
    Envelope, Feature, FeatureReader, FeatureType, ShapeType, ShapefileConfig, ShapefileResult,
    ShapefileStore, Shape, WriteMode,
};
use std::backtrace::Backtrace;
use std::fs::{File, FileTimes};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use std::thread;
use tempfile::TempDir;

/// Runs a test with retry logic and error handling.
/// Tests run on the current thread so lock behaviour stays deterministic.
pub fn run_test<T, B, A>(before: B, test: T, after: A) -> ()
where
    T: Fn(TestContext) -> ShapefileResult<()> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
    B: Fn() -> ShapefileResult<TestContext> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
    A: Fn(TestContext) -> ShapefileResult<()> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
{
    const MAX_RETRIES: u32 = 3;
    let mut last_error: Option<String> = None;
    let mut last_backtrace: Option<String> = None;

    for attempt in 1..=MAX_RETRIES {
        let start_time = Instant::now();

        let result = std::panic::catch_unwind(|| {
            let backtrace = Backtrace::capture();
            match before() {
                Ok(ctx) => match test(ctx.clone()) {
                    Ok(_) => match after(ctx) {
                        Ok(_) => Ok(()),
                        Err(e) => Err((format!("After run failed: {:?}", e), backtrace.to_string())),
                    },
                    Err(e) => {
                        let _ = after(ctx);
                        Err((format!("Test failed: {:?}", e), backtrace.to_string()))
                    }
                },
                Err(e) => Err((format!("Before run failed: {:?}", e), backtrace.to_string())),
            }
        });

        let elapsed = start_time.elapsed();

        match result {
            Ok(Ok(_)) => return,
            Ok(Err((e, bt))) => {
                last_error = Some(e.clone());
                last_backtrace = Some(bt);
                if attempt < MAX_RETRIES {
                    eprintln!(
                        "\n========== Test Attempt {}/{} Failed (took {:?}) ==========",
                        attempt, MAX_RETRIES, elapsed
                    );
                    eprintln!("Error: {}", e);
                    thread::sleep(Duration::from_millis(100 * attempt as u64));
                }
            }
            Err(panic_err) => {
                let err_msg = if let Some(s) = panic_err.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_err.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                last_error = Some(format!("Panic: {}", err_msg));
                last_backtrace = Some(Backtrace::capture().to_string());

                if attempt < MAX_RETRIES {
                    eprintln!(
                        "\n========== Test Attempt {}/{} Panicked (took {:?}) ==========",
                        attempt, MAX_RETRIES, elapsed
                    );
                    eprintln!("{}", err_msg);
                    thread::sleep(Duration::from_millis(100 * attempt as u64));
                }
            }
        }
    }

    eprintln!("\n==================== TEST FAILED ====================");
    eprintln!("Failed after {} attempts", MAX_RETRIES);
    eprintln!("Last error: {}", last_error.as_deref().unwrap_or("Unknown"));
    if let Some(bt) = &last_backtrace {
        if !bt.is_empty() && !bt.contains("disabled") {
            eprintln!("\nBacktrace:\n{}", bt);
        }
    }
    eprintln!("=====================================================\n");

    panic!(
        "Test failed after {} attempts. Last error: {}",
        MAX_RETRIES,
        last_error.unwrap_or_default()
    );
}

/// A store living in its own temp directory.
#[derive(Clone)]
pub struct TestContext {
    dir: Arc<TempDir>,
    store: ShapefileStore,
}

impl TestContext {
    pub fn new(dir: TempDir, store: ShapefileStore) -> Self {
        Self {
            dir: Arc::new(dir),
            store,
        }
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn shp_path(&self) -> PathBuf {
        self.dir.path().join(format!("{}.shp", TYPE_NAME))
    }

    pub fn store(&self) -> ShapefileStore {
        self.store.clone()
    }

    /// A second store over the same files, with its own index manager.
    pub fn reopen(&self, config: ShapefileConfig) -> ShapefileResult<ShapefileStore> {
        ShapefileStore::open(self.shp_path(), config)
    }
}

pub const TYPE_NAME: &str = "poi";

/// Point schema with a name and a rank attribute.
pub fn poi_schema() -> FeatureType {
    FeatureType::new(TYPE_NAME, ShapeType::Point)
        .with_text("name", 20)
        .with_integer("rank", 6)
}

pub fn create_test_context() -> ShapefileResult<TestContext> {
    create_test_context_with(ShapefileConfig::new())
}

pub fn create_test_context_with(config: ShapefileConfig) -> ShapefileResult<TestContext> {
    let dir = tempfile::tempdir()?;
    let store = ShapefileStore::open(dir.path().join(format!("{}.shp", TYPE_NAME)), config)?;
    store.create_schema(&poi_schema())?;
    Ok(TestContext::new(dir, store))
}

pub fn cleanup(ctx: TestContext) -> ShapefileResult<()> {
    ctx.store().dispose();
    Ok(())
}

/// Appends one point feature per coordinate pair. Names are `p{i}` and
/// ranks `i`, counting from the current feature count.
pub fn insert_points(store: &ShapefileStore, points: &[(f64, f64)]) -> ShapefileResult<()> {
    let offset = store.count(&shapefile_index::Query::all())?;
    let mut writer = store.writer(WriteMode::Append)?;
    for (i, (x, y)) in points.iter().enumerate() {
        let n = offset + i;
        let feature = writer.next()?;
        feature.set_geometry(Shape::point(*x, *y));
        feature.set_attribute("name", format!("p{}", n));
        feature.set_attribute("rank", n as i64);
        writer.write()?;
    }
    writer.close()
}

/// Deterministic points spread uniformly over `[0, extent]²`.
pub fn random_points(seed: u64, count: usize, extent: f64) -> Vec<(f64, f64)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| (rng.random_range(0.0..extent), rng.random_range(0.0..extent)))
        .collect()
}

/// Drains a reader into its features, failing on the first error.
pub fn collect_features(reader: FeatureReader) -> ShapefileResult<Vec<Feature>> {
    reader.collect()
}

/// Identifiers of every feature a reader yields, sorted.
pub fn sorted_ids(reader: FeatureReader) -> ShapefileResult<Vec<String>> {
    let mut ids: Vec<String> = collect_features(reader)?
        .iter()
        .map(|f| f.id().to_string())
        .collect();
    ids.sort();
    Ok(ids)
}

/// Identifiers of the points falling in `bbox`, by brute force.
pub fn brute_force_ids(points: &[(f64, f64)], bbox: &Envelope) -> Vec<String> {
    let mut ids: Vec<String> = points
        .iter()
        .enumerate()
        .filter(|(_, (x, y))| bbox.contains_point(*x, *y))
        .map(|(i, _)| format!("{}.{}", TYPE_NAME, i + 1))
        .collect();
    ids.sort();
    ids
}

/// Moves a file's modification time `secs` seconds into the past.
pub fn age_file(path: &Path, secs: u64) -> ShapefileResult<()> {
    let when = SystemTime::now() - Duration::from_secs(secs);
    let file = File::options().write(true).open(path)?;
    file.set_times(FileTimes::new().set_modified(when))?;
    Ok(())
}

pub fn is_sorted<T: Ord>(iterable: impl IntoIterator<Item = T>, ascending: bool) -> bool {
    let mut iter = iterable.into_iter();
    if let Some(mut prev) = iter.next() {
        for current in iter {
            if ascending {
                if prev > current {
                    return false;
                }
            } else if prev < current {
                return false;
            }
            prev = current;
        }
    }
    true
}
