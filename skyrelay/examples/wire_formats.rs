//! Demonstration of the four regional wire formats and their normalization.
//!
//! Each region encodes the same kind of reading differently. This example
//! samples one reading per region, prints its wire form, and normalizes it
//! back to the canonical `[t//h//p//r]` form, both with and without knowing
//! the region.

use skyrelay::drone::sample;
use skyrelay::record::{self, Region};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut rng = rand::rng();

    for region in Region::ALL {
        let sampled = sample(region, &mut rng);
        let wire = sampled.encode();

        // Region-aware parsing uses the region's own delimiter and brackets.
        let canonical = record::normalize_for(region, &wire)?;
        println!("{region:<6} {wire:<40} -> {canonical}");

        // Without a region the delimiter is detected from the payload.
        match record::normalize(&wire) {
            Ok(detected) => assert_eq!(detected, canonical),
            Err(e) => println!("       (detection failed: {e})"),
        }
    }

    // A payload in the wrong scheme for its region is rejected.
    let mismatch = record::normalize_for(Region::Leste, "970.10-650.20-28.50-60.00");
    println!("Leste with hyphens -> {mismatch:?}");

    Ok(())
}
