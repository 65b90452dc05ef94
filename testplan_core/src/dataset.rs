//! Synthetic dataset bodies.

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fmt::Write;

/// Name of the dataset every scenario transfers.
pub const DATASET_NAME: &str = "megajoules";

/// Header row of generated bodies.
pub const CSV_HEADER: &str = "id,date,count,data";

/// Generates a CSV body of `rows` records (plus header).
///
/// Records are `id,date,count,data` with a 1-based id, a date in 2019, a
/// random count and a short random alphanumeric payload.
pub fn generate_csv<R: Rng + ?Sized>(rng: &mut R, rows: usize) -> String {
    let mut body = String::with_capacity(32 * (rows + 1));
    body.push_str(CSV_HEADER);
    body.push('\n');

    for id in 1..=rows {
        let month = rng.gen_range(1..=12);
        let day = rng.gen_range(1..=28);
        let count = rng.gen_range(0..100_000u32);
        let data: String = (0..12).map(|_| char::from(rng.sample(Alphanumeric))).collect();
        // Writing to a String cannot fail
        let _ = writeln!(body, "{id},2019-{month:02}-{day:02},{count},{data}");
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_row_count_and_header() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let body = generate_csv(&mut rng, 25);
        let lines: Vec<_> = body.lines().collect();

        assert_eq!(lines.len(), 26);
        assert_eq!(lines[0], CSV_HEADER);
        assert!(lines[1].starts_with("1,2019-"));
        assert!(lines[25].starts_with("25,"));
        assert!(lines.iter().skip(1).all(|l| l.split(',').count() == 4));
    }

    #[test]
    fn test_same_seed_same_body() {
        let a = generate_csv(&mut ChaCha8Rng::seed_from_u64(7), 10);
        let b = generate_csv(&mut ChaCha8Rng::seed_from_u64(7), 10);
        assert_eq!(a, b);
    }
}
