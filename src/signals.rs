//! Pure signal transformations for the caster interface.
//!
//! A signal is the upper-case name of a pneumatic valve ("N", "G", "0075",
//! "O15", a row number). Combinations travel through here as sets; the
//! interface re-orders them into the canonical wire order before storing.

use std::collections::HashSet;

/// Normalize raw client tokens: trim, upper-case, drop empties.
pub fn normalize<I, S>(raw: I) -> HashSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter()
        .map(|s| s.as_ref().trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Return the signals in canonical order: the order implied by the
/// concatenation of the four configured valve tuples. Names outside the
/// configured layout keep a deterministic (sorted) position at the end.
pub fn ordered_signals(signals: &HashSet<String>, order: &[String]) -> Vec<String> {
    let mut ordered: Vec<String> = order
        .iter()
        .filter(|name| signals.contains(*name))
        .cloned()
        .collect();
    let mut unknown: Vec<String> = signals
        .iter()
        .filter(|name| !order.contains(name))
        .cloned()
        .collect();
    unknown.sort();
    ordered.extend(unknown);
    ordered
}

/// Plain addressing: there is no row 16, the wedge rests at 15.
pub fn strip_16(signals: &HashSet<String>) -> HashSet<String> {
    let mut out = signals.clone();
    if out.remove("16") {
        out.insert("15".to_string());
    }
    out
}

/// Unit shift attachment. The D air pin drives the attachment itself, so
/// column D is addressed as E+F whenever the attachment is in use, and a
/// row 16 combination gets the D signal added.
pub fn convert_unitshift(signals: &HashSet<String>) -> HashSet<String> {
    let mut out = signals.clone();
    if out.remove("D") {
        out.insert("E".to_string());
        out.insert("F".to_string());
    }
    if out.remove("16") {
        out.insert("D".to_string());
    }
    out
}

/// HMN attachment: row 16 is selected by an extra pin combination chosen
/// by the column of the matrix.
pub fn convert_hmn(signals: &HashSet<String>) -> HashSet<String> {
    convert_row16_attachment(signals, "H")
}

/// KMN attachment, the later variant of HMN with K in place of H.
pub fn convert_kmn(signals: &HashSet<String>) -> HashSet<String> {
    convert_row16_attachment(signals, "K")
}

fn convert_row16_attachment(signals: &HashSet<String>, first_pin: &str) -> HashSet<String> {
    let mut out = signals.clone();
    if !out.remove("16") {
        return out;
    }
    let has = |name: &str| out.contains(name);
    let extras: &[&str] = if has("N") && (has("I") || has("L")) {
        // NI and NL keep their own pins, the attachment pin alone marks row 16
        &[first_pin]
    } else if has(first_pin) {
        &["N"]
    } else if has("M") {
        &["N"]
    } else if has("N") {
        &["M"]
    } else {
        &[first_pin, "M", "N"]
    };
    for extra in extras {
        out.insert((*extra).to_string());
    }
    out
}

/// For testing: a bare "O" or "15" becomes the combined O+15 signal,
/// which is a real valve on the interface.
pub fn convert_o15(signals: &HashSet<String>) -> HashSet<String> {
    let mut out = signals.clone();
    let o = out.remove("O");
    let fifteen = out.remove("15");
    if o || fifteen {
        out.insert("O15".to_string());
    }
    out
}

/// For casting: O+15 is never sent, the caster implies it.
pub fn strip_o15(signals: &HashSet<String>) -> HashSet<String> {
    let mut out = signals.clone();
    out.remove("O15");
    out
}

/// For punching: a combination of fewer than two signals gets an O+15
/// added, otherwise the ribbon advance mechanism will not engage.
pub fn add_missing_o15(signals: &HashSet<String>) -> HashSet<String> {
    let mut out = signals.clone();
    if out.len() < 2 {
        out.insert("O15".to_string());
    }
    out
}
