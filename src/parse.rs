use std::collections::BTreeSet;

/// Extract bib numbers from free-form model output.
///
/// Every maximal run of ASCII digits is a candidate; runs whose length falls
/// outside `min_len..=max_len` are dropped whole rather than truncated.
pub fn extract_bib_numbers(text: &str, min_len: usize, max_len: usize) -> BTreeSet<String> {
    let accepts = |run: &str| (min_len..=max_len).contains(&run.len());

    text.split(|c: char| !c.is_ascii_digit())
        .filter(|run| !run.is_empty() && accepts(run))
        .map(str::to_owned)
        .collect()
}
