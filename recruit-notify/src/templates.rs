//! Message templates
//!
//! Every interpolated value passes through [`escape_html`]; survey data and
//! configuration text are never trusted as markup.

use recruit_common::config::NotifyConfig;
use recruit_common::{Category, EmailMessage};

/// Study-level text shared by all templates
#[derive(Debug, Clone)]
pub struct Templates {
    sender: Option<String>,
    study_name: String,
    lab_name: String,
    contact_email: Option<String>,
    scheduling_url: Option<String>,
    show_reasons: bool,
}

impl Templates {
    pub fn from_config(config: &NotifyConfig) -> Self {
        Self {
            sender: config.sender.clone(),
            study_name: config.study_name.clone(),
            lab_name: config.lab_name.clone(),
            contact_email: config.contact_email.clone(),
            scheduling_url: config.scheduling_url.clone(),
            show_reasons: config.show_reasons,
        }
    }

    /// Invitation for an eligible participant.
    ///
    /// `category` selects the arm-specific paragraph; `None` (identifier
    /// outside every configured range) falls back to the generic text.
    pub fn invite(&self, to: &str, study_id: &str, category: Option<Category>) -> EmailMessage {
        let arm_paragraph = match category {
            Some(Category::HealthyControl) => {
                "You are invited to join the study as a healthy control participant. \
                 Healthy control data lets us tell apart the brain signals that are \
                 typical from those linked to depression."
            }
            Some(Category::Mdd) => {
                "You are invited to join the study as a participant with depression. \
                 Your participation helps us understand how brain connectivity \
                 differs in depression and how it responds to stimulation."
            }
            None => "Based on your screening responses, you may be eligible to participate.",
        };

        let scheduling = match &self.scheduling_url {
            Some(url) => format!(
                r#"<p><strong>To schedule your virtual consent session:</strong></p>
    <p><a href="{url}">Book your consent session</a></p>
    <p>Please enter your Study ID instead of your name when booking.</p>"#,
                url = escape_html(url)
            ),
            None => "<p>A member of our team will contact you to schedule a virtual consent session.</p>"
                .to_string(),
        };

        let html = format!(
            r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="UTF-8"><title>{study}</title></head>
<body>
    <p>Hello,</p>
    <p>Thank you for completing the screening survey for the {study}. Based on your responses, you may be eligible to participate!</p>
    <p>{arm}</p>
    <p>Your Study ID is: <strong>{study_id}</strong></p>
    {scheduling}
    {contact}
    <p>Thank you so much for your interest in our study!</p>
    <p>Best,<br>{lab}</p>
</body>
</html>"#,
            study = escape_html(&self.study_name),
            arm = arm_paragraph,
            study_id = escape_html(study_id),
            scheduling = scheduling,
            contact = self.contact_paragraph(),
            lab = escape_html(&self.lab_name),
        );

        EmailMessage {
            to: to.to_string(),
            from: self.sender.clone(),
            subject: format!("{} - Schedule Your Visit (Study ID: {})", self.study_name, study_id),
            html,
        }
    }

    /// Notice for a participant found ineligible. Reasons are listed only
    /// when `show_reasons` is configured.
    pub fn ineligible_notice(&self, to: &str, reasons: &[String]) -> EmailMessage {
        let reasons_block = if self.show_reasons && !reasons.is_empty() {
            let items: String = reasons
                .iter()
                .map(|r| format!("<li>{}</li>", escape_html(r)))
                .collect();
            format!(
                "<p>Based on your screening responses, you do not currently meet the following study criteria:</p>\n    <ul>{}</ul>",
                items
            )
        } else {
            String::new()
        };

        let html = format!(
            r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="UTF-8"><title>{study}</title></head>
<body>
    <p>Dear Participant,</p>
    <p>Thank you for your interest in the {study} and for taking the time to complete the screening questionnaire.</p>
    <p>We have carefully reviewed your responses. Our research team maintains a participant pool based on current study needs and enrollment capacity, and we will reach out if an opening becomes available that matches your profile.</p>
    {reasons}
    {contact}
    <p>Thank you once again for your interest in our research.</p>
    <p>Best regards,<br>{lab}</p>
</body>
</html>"#,
            study = escape_html(&self.study_name),
            reasons = reasons_block,
            contact = self.contact_paragraph(),
            lab = escape_html(&self.lab_name),
        );

        EmailMessage {
            to: to.to_string(),
            from: self.sender.clone(),
            subject: "Thank You for Your Interest in Our Research Study".to_string(),
            html,
        }
    }

    fn contact_paragraph(&self) -> String {
        match &self.contact_email {
            Some(email) => format!(
                r#"<p>If you have any questions, please contact us at <a href="mailto:{0}">{0}</a>.</p>"#,
                escape_html(email)
            ),
            None => "<p>If you have any questions, please reply to this email.</p>".to_string(),
        }
    }
}

pub fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn templates(show_reasons: bool) -> Templates {
        Templates::from_config(&NotifyConfig {
            show_reasons,
            scheduling_url: Some("https://example.org/book?a=1&b=2".into()),
            contact_email: Some("study@example.org".into()),
            ..Default::default()
        })
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<b>"Tom" & 'Jerry'</b>"#),
            "&lt;b&gt;&quot;Tom&quot; &amp; &#39;Jerry&#39;&lt;/b&gt;"
        );
    }

    #[test]
    fn test_invite_is_category_specific() {
        let t = templates(false);
        let hc = t.invite("p@example.org", "HC-3000", Some(Category::HealthyControl));
        let mdd = t.invite("p@example.org", "MDD-10200", Some(Category::Mdd));

        assert!(hc.html.contains("healthy control participant"));
        assert!(!hc.html.contains("participant with depression"));
        assert!(mdd.html.contains("participant with depression"));
        assert!(hc.subject.contains("HC-3000"));
        assert!(mdd.html.contains("<strong>MDD-10200</strong>"));
        assert_eq!(hc.to, "p@example.org");
    }

    #[test]
    fn test_invite_escapes_interpolated_values() {
        let t = templates(false);
        let message = t.invite("p@example.org", "<script>", None);
        assert!(message.html.contains("&lt;script&gt;"));
        assert!(!message.html.contains("<script>"));
        assert!(message.html.contains("https://example.org/book?a=1&amp;b=2"));
    }

    #[test]
    fn test_invite_without_scheduling_url() {
        let t = Templates::from_config(&NotifyConfig::default());
        let message = t.invite("p@example.org", "HC-3001", Some(Category::HealthyControl));
        assert!(message.html.contains("will contact you to schedule"));
        assert!(message.html.contains("reply to this email"));
    }

    #[test]
    fn test_ineligible_notice_hides_reasons_by_default() {
        let reasons = vec!["age 16 below minimum of 18".to_string()];
        let hidden = templates(false).ineligible_notice("p@example.org", &reasons);
        assert!(!hidden.html.contains("below minimum"));

        let shown = templates(true).ineligible_notice("p@example.org", &reasons);
        assert!(shown.html.contains("<li>age 16 below minimum of 18</li>"));
    }

    #[test]
    fn test_ineligible_notice_escapes_reasons() {
        let reasons = vec!["<img src=x>".to_string()];
        let message = templates(true).ineligible_notice("p@example.org", &reasons);
        assert!(message.html.contains("<li>&lt;img src=x&gt;</li>"));
    }
}
