//! Aides autour de `xmltree` : sérialisation sans déclaration XML,
//! itération sur les éléments enfants et comparaison structurelle.

use std::borrow::Cow;

use xmltree::{Element, EmitterConfig, XMLNode};

/// Analyse un document XML depuis une chaîne.
pub fn parse_str(xml: &str) -> Result<Element, xmltree::ParseError> {
    Element::parse(xml.as_bytes())
}

/// Sérialise un élément en chaîne, sans déclaration `<?xml …?>`.
///
/// L'ordre de sérialisation des attributs n'est pas garanti : ne jamais
/// comparer deux éléments par leurs chaînes, utiliser
/// [`elements_equal`].
pub fn element_to_string(elem: &Element) -> String {
    let mut buf = Vec::new();
    let config = EmitterConfig::new().write_document_declaration(false);
    // L'écriture vers un Vec ne peut échouer que sur un document
    // invalide, impossible pour un Element déjà construit.
    let _ = elem.write_with_config(&mut buf, config);
    String::from_utf8(buf).unwrap_or_default()
}

/// Itère sur les enfants de type élément (ignore textes et commentaires).
pub fn child_elements(elem: &Element) -> impl Iterator<Item = &Element> {
    elem.children.iter().filter_map(|node| match node {
        XMLNode::Element(child) => Some(child),
        _ => None,
    })
}

/// Texte direct d'un élément, blancs normalisés, ou chaîne vide.
pub fn normalized_text(elem: &Element) -> String {
    match elem.get_text() {
        Some(text) => collapse_whitespace(&text),
        None => String::new(),
    }
}

/// Remplace toute suite de blancs par un espace simple et retire les
/// blancs de tête et de queue.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Compare deux éléments structurellement : nom, attributs, texte
/// normalisé et enfants (récursivement, dans l'ordre).
pub fn elements_equal(a: &Element, b: &Element) -> bool {
    if a.name != b.name || a.attributes != b.attributes {
        return false;
    }
    if normalized_text_deep(a) != normalized_text_deep(b) {
        return false;
    }
    let a_children: Vec<&Element> = child_elements(a).collect();
    let b_children: Vec<&Element> = child_elements(b).collect();
    a_children.len() == b_children.len()
        && a_children
            .iter()
            .zip(b_children.iter())
            .all(|(ca, cb)| elements_equal(ca, cb))
}

fn normalized_text_deep(elem: &Element) -> String {
    let text: Cow<'_, str> = elem.get_text().unwrap_or(Cow::Borrowed(""));
    collapse_whitespace(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_normalisation() {
        let elem = parse_str("<uri>\n    http://example.com/a.xml\n</uri>").unwrap();
        assert_eq!(normalized_text(&elem), "http://example.com/a.xml");
    }

    #[test]
    fn structural_equality_ignores_whitespace() {
        let a = parse_str("<item a='1' b='2'><uri>  x </uri></item>").unwrap();
        let b = parse_str("<item b='2' a='1'><uri>x</uri></item>").unwrap();
        assert!(elements_equal(&a, &b));
    }

    #[test]
    fn structural_equality_detects_differences() {
        let a = parse_str("<item a='1'/>").unwrap();
        let b = parse_str("<item a='2'/>").unwrap();
        let c = parse_str("<other a='1'/>").unwrap();
        assert!(!elements_equal(&a, &b));
        assert!(!elements_equal(&a, &c));
    }

    #[test]
    fn serialisation_roundtrip() {
        let a = parse_str("<item a='1'><child>t</child></item>").unwrap();
        let s = element_to_string(&a);
        let b = parse_str(&s).unwrap();
        assert!(elements_equal(&a, &b));
    }
}
