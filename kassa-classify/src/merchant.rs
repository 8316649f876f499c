use std::collections::HashSet;
use std::sync::LazyLock;

/// Payment providers skipped when hunting for the actual merchant.
const STRIP_PREFIXES: [&str; 5] = ["PAYPAL", "SUMUP", "ZETTLE", "STRIPE", "KLARNA"];

/// Merchants commonly seen in German bank feeds.
pub static KNOWN_MERCHANTS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    HashSet::from([
        // Supermarkets
        "REWE", "EDEKA", "LIDL", "ALDI", "PENNY", "NETTO", "KAUFLAND",
        // Drugstores
        "DM", "ROSSMANN", "MUELLER",
        // Restaurants and delivery
        "STARBUCKS", "MCDONALDS", "BURGERKING", "LIEFERANDO", "TAKEAWAY",
        // Streaming
        "SPOTIFY", "NETFLIX", "DISNEY", "AMAZON", "DAZN",
        // Telecom
        "TELEKOM", "VODAFONE", "O2", "CONGSTAR",
        // Transport
        "ARAL", "SHELL", "TOTAL", "HVV", "BVG", "MVV", "UBER", "TIER", "NEXTBIKE",
        // Fitness
        "FITX", "MCFIT", "URBANSPORTS",
        // Insurance
        "HUK", "ALLIANZ", "ERGO", "AXA",
    ])
});

/// Extract a normalised merchant name from a raw counterparty string:
/// strip payment-provider prefixes and return the leading token.
#[must_use]
pub fn extract_merchant(counterparty: Option<&str>) -> Option<String> {
    let text = counterparty?.trim().to_uppercase();
    if text.is_empty() {
        return None;
    }

    if let Some(provider) = STRIP_PREFIXES
        .iter()
        .find(|provider| text.starts_with(**provider))
    {
        // PayPal-style "PAYPAL *MERCHANT/REF": the first meaningful
        // segment after the provider is the merchant.
        let remainder = &text[provider.len()..];
        return remainder
            .split(['.', '/', '*', ' '])
            .map(str::trim)
            .find(|segment| segment.len() > 2 && !STRIP_PREFIXES.contains(segment))
            .map(str::to_string);
    }

    let leading: String = text
        .chars()
        .take_while(|ch| ch.is_alphabetic())
        .collect();
    if leading.is_empty() || STRIP_PREFIXES.contains(&leading.as_str()) {
        None
    } else {
        Some(leading)
    }
}

#[must_use]
pub fn is_known_merchant(merchant: Option<&str>) -> bool {
    merchant.is_some_and(|merchant| KNOWN_MERCHANTS.contains(merchant.to_uppercase().as_str()))
}
