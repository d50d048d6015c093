use crate::types::Source;

/// Splits a flow's volume across its sources: `volume / n` each, plus one for
/// the first `volume % n` sources in configuration order.
pub fn allocate(volume: u32, sources: &[Source]) -> Vec<(Source, u32)> {
    if sources.is_empty() {
        return Vec::new();
    }
    let count = sources.len() as u32;
    let base = volume / count;
    let extra = volume % count;

    sources
        .iter()
        .enumerate()
        .map(|(i, source)| {
            let share = base + u32::from((i as u32) < extra);
            (source.clone(), share)
        })
        .collect()
}
