//! Prompt builders for the two structured requests the pipeline makes.

pub fn text_decomposition(text: &str) -> String {
    format!(
        "Break the text below into independent semantic units. For each unit give:\n\
         - semantic_unit: a short paraphrase of one self-contained idea\n\
         - entities: the named entities it mentions, in upper case\n\
         - relationships: \"SOURCE, relation, TARGET\" strings between those entities\n\
         Use only entities that appear in the unit.\n\n\
         Text:\n{text}"
    )
}

pub fn relationship_reconstruction(fragment: &str) -> String {
    format!(
        "The following relationship was extracted in a malformed shape. Rewrite it as one \
         relationship with a source entity, a relationship description and a target entity.\n\n\
         Relationship: {fragment}"
    )
}
