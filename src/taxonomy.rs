// No accepted name may appear on the left, so canonicalize stays idempotent.
const SYNONYMS: &[(&str, &str)] = &[
    ("Procambarus fallax f. virginalis", "Procambarus virginalis"),
    ("Procambarus fallax virginalis", "Procambarus virginalis"),
    ("Pueraria lobata", "Pueraria montana"),
    ("Pueraria montana var. lobata", "Pueraria montana"),
    ("Vespa velutina nigrithorax", "Vespa velutina"),
    ("Trachemys scripta elegans", "Trachemys scripta"),
    ("Trachemys scripta scripta", "Trachemys scripta"),
    ("Trachemys scripta troostii", "Trachemys scripta"),
    ("Orconectes limosus", "Faxonius limosus"),
    ("Orconectes virilis", "Faxonius virilis"),
    ("Orconectes rusticus", "Faxonius rusticus"),
    ("Lithobates catesbeianus", "Aquarana catesbeiana"),
    ("Rana catesbeiana", "Aquarana catesbeiana"),
    ("Threskiornis aethiopicus aethiopicus", "Threskiornis aethiopicus"),
    ("Alopochen aegyptiaca", "Alopochen aegyptiacus"),
    ("Myocastor coypus bonariensis", "Myocastor coypus"),
    ("Heracleum sosnowskyi subsp. sosnowskyi", "Heracleum sosnowskyi"),
    ("Ailanthus glandulosa", "Ailanthus altissima"),
    ("Impatiens glandulifera subsp. glandulifera", "Impatiens glandulifera"),
    ("Elodea nuttalii", "Elodea nuttallii"),
    ("Gymnocoronis spilanthoides var. subcordata", "Gymnocoronis spilanthoides"),
    ("Acridotheres tristis tristis", "Acridotheres tristis"),
    ("Nasua nasua nasua", "Nasua nasua"),
    ("Sciurus carolinensis carolinensis", "Sciurus carolinensis"),
    ("Tamias sibiricus", "Eutamias sibiricus"),
];

pub fn canonicalize(name: &str) -> String {
    let normalized = name.split_whitespace().collect::<Vec<_>>().join(" ");
    SYNONYMS
        .iter()
        .find(|(synonym, _)| *synonym == normalized)
        .map(|(_, accepted)| (*accepted).to_string())
        .unwrap_or(normalized)
}
