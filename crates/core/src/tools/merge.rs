//! # Artifact Merge
//!
//! Combines the web-research and repository-analysis artifacts of a Hybrid
//! run into one [`SynthesisArtifact`].
//!
//! ## The Rules
//!
//! 1. **Union**: every entry from both inputs is considered, `a` before `b`
//! 2. **Dedupe**: entries with the same normalized subject, guidance and
//!    stance collapse into one; if the sources differ it is tagged `merged`
//! 3. **Contradict**: entries on the same subject with opposing stances are
//!    all kept, each annotated with the guidance it conflicts with
//! 4. **Gaps**: gap markers are unioned, searched locations deduplicated
//!
//! The merge is a pure function of its inputs.

use std::collections::{BTreeMap, BTreeSet};

use crate::workers::artifact_registry::{
    Category, CategoryName, ConflictNote, Entry, GapMarker, Provenance, Stance, SynthesisArtifact,
};

/// Lowercase words joined by single spaces
fn normalize(text: &str) -> String {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Opposing stances never share a key, so a contradiction survives dedupe
fn entry_key(entry: &Entry) -> (String, String, Stance) {
    (
        normalize(&entry.subject),
        normalize(&entry.guidance),
        entry.stance,
    )
}

/// Merge two artifacts
pub fn merge(a: &SynthesisArtifact, b: &SynthesisArtifact) -> SynthesisArtifact {
    let mut merged = SynthesisArtifact::empty(&a.target_name);
    for name in CategoryName::ALL {
        *merged.category_mut(name) = merge_category(a.category(name), b.category(name));
    }

    let contradictions: usize = CategoryName::ALL
        .iter()
        .flat_map(|n| merged.category(*n).entries.iter())
        .filter(|e| !e.conflicts_with.is_empty())
        .count();
    tracing::debug!(
        "Merged artifacts for '{}' ({} entries in contradiction)",
        merged.target_name,
        contradictions
    );
    merged
}

fn merge_category(a: &Category, b: &Category) -> Category {
    let mut entries: Vec<Entry> = Vec::new();
    let mut index: BTreeMap<(String, String, Stance), usize> = BTreeMap::new();

    for entry in a.entries.iter().chain(b.entries.iter()) {
        let key = entry_key(entry);
        match index.get(&key) {
            Some(&i) => {
                let survivor = &mut entries[i];
                if survivor.provenance != entry.provenance {
                    survivor.provenance = Provenance::Merged;
                }
                survivor.specificity = survivor.specificity.max(entry.specificity);
                for note in &entry.conflicts_with {
                    if !survivor.conflicts_with.contains(note) {
                        survivor.conflicts_with.push(note.clone());
                    }
                }
            }
            None => {
                index.insert(key, entries.len());
                entries.push(entry.clone());
            }
        }
    }

    annotate_contradictions(&mut entries);

    Category {
        entries,
        gap: merge_gaps(a.gap.as_ref(), b.gap.as_ref()),
    }
}

/// Annotate every pair of same-subject entries with opposing stances
fn annotate_contradictions(entries: &mut [Entry]) {
    let mut by_subject: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, entry) in entries.iter().enumerate() {
        by_subject.entry(normalize(&entry.subject)).or_default().push(i);
    }

    let mut notes: Vec<(usize, ConflictNote)> = Vec::new();
    for group in by_subject.values().filter(|g| g.len() > 1) {
        for &i in group {
            for &j in group {
                if i != j && entries[i].stance.contradicts(&entries[j].stance) {
                    notes.push((
                        i,
                        ConflictNote {
                            provenance: entries[j].provenance,
                            stance: entries[j].stance,
                            guidance: entries[j].guidance.clone(),
                        },
                    ));
                }
            }
        }
    }

    for (i, note) in notes {
        if !entries[i].conflicts_with.contains(&note) {
            entries[i].conflicts_with.push(note);
        }
    }
}

fn merge_gaps(a: Option<&GapMarker>, b: Option<&GapMarker>) -> Option<GapMarker> {
    match (a, b) {
        (None, None) => None,
        (Some(g), None) | (None, Some(g)) => Some(g.clone()),
        (Some(a), Some(b)) => {
            let mut seen = BTreeSet::new();
            let searched = a
                .searched
                .iter()
                .chain(b.searched.iter())
                .filter(|s| seen.insert(s.as_str()))
                .cloned()
                .collect();
            let note = match (a.note.is_empty(), b.note.is_empty()) {
                (false, false) if a.note != b.note => format!("{}; {}", a.note, b.note),
                (true, _) => b.note.clone(),
                _ => a.note.clone(),
            };
            Some(GapMarker { searched, note })
        }
    }
}
