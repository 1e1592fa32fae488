use crate::catalog::Product;
use std::collections::BTreeMap;
use tracing::info;

/// Keeps one product per acquisition date: the one with the highest processing
/// baseline. Names without a parsable baseline rank as baseline 0. On equal baselines
/// the product that comes later in `products` wins. The result is sorted by date.
pub fn select_latest(products: Vec<Product>) -> Vec<Product> {
    let mut by_date: BTreeMap<String, (u16, Product)> = BTreeMap::new();

    for product in products {
        let baseline = product.baseline().unwrap_or(0);
        let date = product.acquisition_date().to_string();

        // `>=` so that the later of two equal baselines wins
        let replace = by_date
            .get(&date)
            .map_or(true, |(best, _)| baseline >= *best);
        if replace {
            by_date.insert(date, (baseline, product));
        }
    }

    by_date
        .into_iter()
        .map(|(date, (baseline, product))| {
            info!(
                %date,
                baseline,
                name = %product.name,
                id = %product.id,
                s3_path = product.s3_path.as_deref().unwrap_or("-"),
                "Selected product"
            );
            product
        })
        .collect()
}
