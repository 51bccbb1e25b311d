use once_cell::sync::Lazy;
use regex::{NoExpand, Regex};

static RE_MEDIA_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\[(.+)\]\(Media:(.+) "wikilink"\)"#).unwrap());

static RE_PAGE_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\[(.+)\]\((.+) "wikilink"\)"#).unwrap());

static RE_ANCHOR: Lazy<Regex> = Lazy::new(|| Regex::new(r#"<a href="(.+?)".*>(.+)</a>"#).unwrap());

static RE_MD_IMAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"!\[(.*)\]\((.+) "(.+)"\)"#).unwrap());

static RE_IMG_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<img src="(.+)" title="(.+?)"(.*?)/>"#).unwrap());

/// Rewrite converter-emitted links into site-absolute form, line by line.
/// At most one rule fires per line; rules are tried in a fixed order and
/// lines matching none pass through unchanged.
pub fn rewrite_links(content: &str) -> String {
    let lines: Vec<String> = content.split('\n').map(rewrite_line).collect();
    lines.join("\n")
}

fn rewrite_line(line: &str) -> String {
    if let Some(caps) = RE_MEDIA_LINK.captures(line) {
        let label = &caps[1];
        let target = caps[2].to_lowercase();
        let title = label.replace('"', "");
        let replacement = format!("[{label}](/assets/{target} \"{title}\")");
        return RE_MEDIA_LINK
            .replace_all(line, NoExpand(&replacement))
            .into_owned();
    }

    if let Some(caps) = RE_PAGE_LINK.captures(line) {
        let label = caps[1].replace(':', "/");
        let mut target = caps[2].replace(':', "/").replace('.', "_");
        if let Some(position) = target.rfind('#') {
            let fragment = target[position + 1..].to_lowercase();
            target.truncate(position + 1);
            target.push_str(&fragment);
        }
        let title = label.replace('"', "\\\"").replace('\'', "\\'");
        let replacement = format!("[{}](/{target} \"{title}\")", label.trim());
        return RE_PAGE_LINK
            .replace_all(line, NoExpand(&replacement))
            .into_owned();
    }

    if let Some(caps) = RE_ANCHOR.captures(line) {
        let target = caps[1].replace(':', "/");
        let label = &caps[2];
        let replacement = format!("<a href=\"/{target}\" title=\"{label}\">{label}</a>");
        return RE_ANCHOR
            .replace_all(line, NoExpand(&replacement))
            .into_owned();
    }

    if let Some(caps) = RE_MD_IMAGE.captures(line) {
        let label = &caps[1];
        let target = caps[2].to_lowercase();
        let title = caps[3].replace('"', "\\\"").replace('\'', "\\'");
        let replacement = format!("![{label}](/assets/{target} \"{title}\")");
        return RE_MD_IMAGE
            .replace_all(line, NoExpand(&replacement))
            .into_owned();
    }

    if let Some(caps) = RE_IMG_TAG.captures(line) {
        let source = caps[1].to_lowercase();
        let title = &caps[2];
        let rest = &caps[3];
        let replacement = format!("<img src=\"/assets/{source}\" title=\"{title}\" {rest} />");
        return RE_IMG_TAG
            .replace_all(line, NoExpand(&replacement))
            .into_owned();
    }

    line.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_links_point_into_the_asset_folder() {
        let line = r#"[Handbuch](Media:OP7000_Handbuch.PDF "wikilink")"#;
        assert_eq!(
            rewrite_line(line),
            r#"[Handbuch](/assets/op7000_handbuch.pdf "Handbuch")"#
        );
    }

    #[test]
    fn media_link_titles_drop_embedded_quotes_but_labels_keep_them() {
        let line = r#"[Das "alte" Handbuch](Media:manual.pdf "wikilink")"#;
        assert_eq!(
            rewrite_line(line),
            r#"[Das "alte" Handbuch](/assets/manual.pdf "Das alte Handbuch")"#
        );
    }

    #[test]
    fn media_rule_lowercases_the_asset_name_and_not_the_label() {
        let line = r#"[OP7000 Handbuch](Media:OP7000.PDF "wikilink")"#;
        assert_eq!(
            rewrite_line(line),
            r#"[OP7000 Handbuch](/assets/op7000.pdf "OP7000 Handbuch")"#
        );
    }

    #[test]
    fn page_links_become_absolute_paths_with_escaped_titles() {
        let line = r#"[Flash-Partitionierung beim "OP7000"](Customers:DA:OP7000:FlashPartitioning "wikilink")"#;
        assert_eq!(
            rewrite_line(line),
            r#"[Flash-Partitionierung beim "OP7000"](/Customers/DA/OP7000/FlashPartitioning "Flash-Partitionierung beim \"OP7000\"")"#
        );
    }

    #[test]
    fn page_link_fragments_are_lowercased() {
        let line = r#"[Setup](Products:OP7000#Install.Notes "wikilink")"#;
        assert_eq!(
            rewrite_line(line),
            r#"[Setup](/Products/OP7000#install_notes "Setup")"#
        );
    }

    #[test]
    fn anchor_targets_are_rooted_and_titles_rewritten() {
        let line = r#"The <a href="Company" title="X">DOMOLOGIC</a> homepage"#;
        assert_eq!(
            rewrite_line(line),
            r#"The <a href="/Company" title="DOMOLOGIC">DOMOLOGIC</a> homepage"#
        );
    }

    #[test]
    fn anchor_colons_become_path_separators() {
        let line = r#"<a href="Products:OP7000">OP7000</a>"#;
        assert_eq!(
            rewrite_line(line),
            r#"<a href="/Products/OP7000" title="OP7000">OP7000</a>"#
        );
    }

    #[test]
    fn markdown_images_move_into_the_asset_folder() {
        let line = r#"![Aufnahme der Einstellung](GatewayPowerMng.jpg "Aufnahme der Einstellung")"#;
        assert_eq!(
            rewrite_line(line),
            r#"![Aufnahme der Einstellung](/assets/gatewaypowermng.jpg "Aufnahme der Einstellung")"#
        );
    }

    #[test]
    fn img_tags_keep_their_trailing_attributes() {
        let line = r#"<img src="Thumbnail_company.png" title="Thumbnail company.png|link=Company" alt="Thumbnail company.png|link=Company" />"#;
        assert_eq!(
            rewrite_line(line),
            r#"<img src="/assets/thumbnail_company.png" title="Thumbnail company.png|link=Company"  alt="Thumbnail company.png|link=Company"  />"#
        );
    }

    #[test]
    fn media_rule_wins_over_the_general_page_rule() {
        let line = r#"[Datenblatt](Media:Datenblatt.pdf "wikilink")"#;
        let rewritten = rewrite_line(line);
        assert!(rewritten.starts_with("[Datenblatt](/assets/"));
    }

    #[test]
    fn plain_lines_pass_through_unchanged() {
        let line = "Just ordinary *markdown* text with [no](link) rewriting.";
        assert_eq!(rewrite_line(line), line);
    }

    #[test]
    fn dollar_signs_in_labels_are_preserved() {
        let line = r#"[Price $100](Shop:Prices "wikilink")"#;
        assert_eq!(rewrite_line(line), r#"[Price $100](/Shop/Prices "Price $100")"#);
    }

    #[test]
    fn rewritten_wikilinks_are_stable_under_a_second_pass() {
        // Rules keyed on the "wikilink" marker consume it, so their output
        // no longer matches any pattern and passes through unchanged.
        let input = concat!(
            "[Handbuch](Media:manual.pdf \"wikilink\")\n",
            "[Seite](Customers:DA \"wikilink\")\n",
            "plain text\n",
        );
        let once = rewrite_links(input);
        let twice = rewrite_links(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn line_structure_is_preserved() {
        let input = "first\n\n[Seite](A:B \"wikilink\")\nlast\n";
        let output = rewrite_links(input);
        assert_eq!(output.split('\n').count(), input.split('\n').count());
        assert!(output.ends_with("last\n"));
    }
}
