use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::model::*;

/// How often undelivered confirmations are retried.
const RETRY_INTERVAL: Duration = Duration::from_secs(60);

pub fn build_confirmation_url(frontend_url: &str, token: &str) -> String {
    format!("{}/email/confirm?token={token}", frontend_url.trim_end_matches('/'))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfirmationMessage {
    pub token: String,
    pub appointment_id: String,
    pub patient_id: String,
    pub doctor_id: String,
    pub subject: String,
    pub body: String,
    pub confirm_url: String,
}

impl ConfirmationMessage {
    pub fn render(appointment: &Appointment, confirmation: &Confirmation, frontend_url: &str) -> Self {
        let confirm_url = build_confirmation_url(frontend_url, &confirmation.token);
        let body = format!(
            "A new appointment was booked for {} at {}.\n\
             Please confirm your attendance using the link below:\n{confirm_url}\n\n\
             If you did not request this appointment, ignore this message.",
            appointment.date,
            format_hhmm(appointment.range.start),
        );
        Self {
            token: confirmation.token.clone(),
            appointment_id: appointment.id.to_string(),
            patient_id: appointment.patient_id.to_string(),
            doctor_id: appointment.doctor_id.to_string(),
            subject: "Confirm your appointment".into(),
            body,
            confirm_url,
        }
    }
}

#[derive(Debug)]
pub struct MailError(pub String);

impl fmt::Display for MailError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mail delivery failed: {}", self.0)
    }
}

impl std::error::Error for MailError {}

/// Outbound delivery of confirmation messages.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn deliver(&self, message: &ConfirmationMessage) -> Result<(), MailError>;
}

/// Writes each message to the log as JSON instead of sending it.
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn deliver(&self, message: &ConfirmationMessage) -> Result<(), MailError> {
        let json = serde_json::to_string(message).map_err(|e| MailError(e.to_string()))?;
        info!(target: "caresched::mail", "{json}");
        Ok(())
    }
}

async fn deliver_one(
    engine: &Engine,
    mailer: &dyn Mailer,
    frontend_url: &str,
    appointment: &Appointment,
    confirmation: &Confirmation,
) {
    let message = ConfirmationMessage::render(appointment, confirmation, frontend_url);
    if let Err(e) = mailer.deliver(&message).await {
        warn!("confirmation for appointment {}: {e}", appointment.id);
        return;
    }
    match engine.mark_confirmation_sent(&confirmation.token, now_ms()).await {
        Ok(()) => debug!("confirmation sent for appointment {}", appointment.id),
        // Expired or doctor removed in between; nothing left to record.
        Err(e) => debug!("confirmation {} not marked sent: {e}", confirmation.token),
    }
}

async fn deliver_backlog(engine: &Engine, mailer: &dyn Mailer, frontend_url: &str) {
    for (appointment, confirmation) in engine.unsent_confirmations(now_ms()).await {
        deliver_one(engine, mailer, frontend_url, &appointment, &confirmation).await;
    }
}

/// Background task that emails a confirmation link for every booking.
///
/// Subscribes before scanning the backlog so no booking falls between the
/// two. Failed deliveries stay unsent and are retried on the next scan.
pub async fn run_mailer(engine: Arc<Engine>, mailer: Arc<dyn Mailer>, frontend_url: String) {
    let mut events = engine.notify.subscribe_all();
    deliver_backlog(&engine, mailer.as_ref(), &frontend_url).await;

    let mut retry = tokio::time::interval(RETRY_INTERVAL);
    retry.tick().await;
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(Event::AppointmentBooked { appointment, confirmation: Some(confirmation) }) => {
                    if confirmation.sent_at.is_none() {
                        deliver_one(&engine, mailer.as_ref(), &frontend_url, &appointment, &confirmation).await;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!("mailer lagged by {missed} events, rescanning");
                    deliver_backlog(&engine, mailer.as_ref(), &frontend_url).await;
                }
                Err(RecvError::Closed) => return,
            },
            _ = retry.tick() => deliver_backlog(&engine, mailer.as_ref(), &frontend_url).await,
        }
    }
}
