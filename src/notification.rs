//! Desktop notification support for new mail alerts

use mail_notifier::Mail;

const SUBJECT_PREVIEW_CHARS: usize = 100;

/// Send a desktop notification for one new mail
pub fn notify_new_mail(mail: &Mail, mailbox: &str) {
    let summary = format!("New mail in {} - {}", mailbox, mail.display_from());
    let body = subject_preview(mail.subject());

    // Fire and forget, don't block on errors
    if let Err(e) = send_notification(&summary, &body) {
        tracing::warn!("Failed to send desktop notification: {}", e);
    }
}

fn subject_preview(subject: &str) -> String {
    if subject.chars().count() > SUBJECT_PREVIEW_CHARS {
        let cut: String = subject.chars().take(SUBJECT_PREVIEW_CHARS - 3).collect();
        format!("{}...", cut)
    } else {
        subject.to_string()
    }
}

/// Low-level notification sending
fn send_notification(summary: &str, body: &str) -> Result<(), notify_rust::error::Error> {
    use notify_rust::Notification;

    let mut notification = Notification::new();
    notification
        .summary(summary)
        .body(body)
        .appname("mail-notifier")
        .timeout(notify_rust::Timeout::Milliseconds(5000));

    // Try to use a mail icon if available
    notification.icon("mail-unread");

    notification.show()?;
    Ok(())
}
