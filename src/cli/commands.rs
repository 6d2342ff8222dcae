use anyhow::Result;
use uuid::Uuid;

use aft_tracker::{
    NewRequest, RequestId, SignatureEvidence, SignatureMethod, SignaturePayload, TransferType,
    TransitionReceipt,
};

use super::{CliContext, Identity};

fn print_receipt(verb: &str, receipt: &TransitionReceipt) {
    println!(
        "✅ {} {}: {} → {}",
        verb, receipt.request.request_number, receipt.from, receipt.to
    );
    if let Some(signature_id) = receipt.signature_id {
        println!("   🖊️  Signature recorded: {signature_id}");
    }
    if receipt.history.is_none() {
        println!("   ⚠️  History entry could not be written; see logs");
    }
}

pub struct CreateCommand {
    pub title: String,
    pub transfer_type: String,
    pub classification: String,
    pub signature_method: SignatureMethod,
}

impl CreateCommand {
    pub async fn execute(&self, ctx: &CliContext, identity: &Identity) -> Result<()> {
        let session = identity.session(&ctx.config);
        let request = ctx
            .service
            .create_draft(
                &session,
                NewRequest {
                    title: self.title.clone(),
                    transfer_type: TransferType::from(self.transfer_type.as_str()),
                    classification: self.classification.clone(),
                    signature_method: self.signature_method,
                },
            )
            .await?;
        println!("📝 Draft created");
        println!("   Request number: {}", request.request_number);
        println!("   Request id:     {}", request.id);
        println!("   Status:         {}", request.status);
        Ok(())
    }
}

pub struct SubmitCommand {
    pub request_id: RequestId,
    pub signer_name: Option<String>,
}

impl SubmitCommand {
    pub async fn execute(&self, ctx: &CliContext, identity: &Identity) -> Result<()> {
        let session = identity.session(&ctx.config);
        let signer = self
            .signer_name
            .clone()
            .unwrap_or_else(|| identity.name.clone());
        let receipt = ctx
            .service
            .submit_request(&session, self.request_id, SignaturePayload::manual(signer))
            .await?;
        print_receipt("Submitted", &receipt);
        Ok(())
    }
}

pub struct ApproveCommand {
    pub request_id: RequestId,
    pub notes: Option<String>,
}

impl ApproveCommand {
    pub async fn execute(&self, ctx: &CliContext, identity: &Identity) -> Result<()> {
        let session = identity.session(&ctx.config);
        let receipt = ctx
            .service
            .approve(&session, self.request_id, self.notes.as_deref())
            .await?;
        print_receipt("Approved", &receipt);
        Ok(())
    }
}

pub struct RejectCommand {
    pub request_id: RequestId,
    pub reason: String,
    pub notes: Option<String>,
}

impl RejectCommand {
    pub async fn execute(&self, ctx: &CliContext, identity: &Identity) -> Result<()> {
        let session = identity.session(&ctx.config);
        let receipt = ctx
            .service
            .reject(&session, self.request_id, &self.reason, self.notes.as_deref())
            .await?;
        print_receipt("Rejected", &receipt);
        Ok(())
    }
}

pub struct SignSmeCommand {
    pub request_id: RequestId,
    pub notes: Option<String>,
}

impl SignSmeCommand {
    pub async fn execute(&self, ctx: &CliContext, identity: &Identity) -> Result<()> {
        let session = identity.session(&ctx.config);
        let receipt = ctx
            .service
            .sign_as_sme(&session, self.request_id, self.notes.as_deref())
            .await?;
        print_receipt("SME signed", &receipt);
        Ok(())
    }
}

pub struct TimelineCommand {
    pub request_id: RequestId,
}

impl TimelineCommand {
    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        let timeline = ctx.service.get_timeline(self.request_id).await?;
        println!("📜 TIMELINE {}", self.request_id);
        println!("==========================");
        println!(
            "Status: {}   Step {}/{} ({:?}, {}%)",
            timeline.status,
            timeline.current_step_index,
            timeline.total_steps,
            timeline.current_step,
            timeline.percent_complete()
        );
        println!();
        for entry in &timeline.entries {
            println!(
                "{}  {:<20} {}",
                entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                entry.action.as_str(),
                entry.actor_email
            );
            if let Some(notes) = &entry.notes {
                for line in notes.lines() {
                    println!("{:>23}{}", "", line);
                }
            }
        }
        Ok(())
    }
}

pub struct SignaturesCommand {
    pub request_id: RequestId,
}

impl SignaturesCommand {
    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        let signatures = ctx.service.list_signatures(self.request_id).await?;
        if signatures.is_empty() {
            println!("No signatures recorded for {}", self.request_id);
            return Ok(());
        }
        for signature in signatures {
            let signer = match &signature.evidence {
                SignatureEvidence::Manual { signer_name, .. } => signer_name.clone(),
                SignatureEvidence::Cac(cac) => cac.certificate.subject.clone(),
            };
            println!(
                "🖊️  {}  {:<20} {:<6} {} <{}>",
                signature.created_at.format("%Y-%m-%d %H:%M:%S"),
                signature.step.as_str(),
                signature.method().as_str(),
                signer,
                signature.signer_email
            );
            println!("    id: {}", signature.id);
        }
        Ok(())
    }
}

pub struct VerifySignatureCommand {
    pub signature_id: Uuid,
}

impl VerifySignatureCommand {
    pub async fn execute(&self, ctx: &CliContext) -> Result<bool> {
        let report = ctx.service.verify_signature(self.signature_id).await?;
        if report.is_intact() {
            println!("✅ Signature {} is intact", self.signature_id);
        } else {
            println!("❌ Signature {} failed verification", self.signature_id);
            for problem in &report.problems {
                println!("   - {problem}");
            }
        }
        Ok(report.is_intact())
    }
}

pub struct AtRiskCommand;

impl AtRiskCommand {
    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        let flagged = ctx.service.at_risk_requests().await?;
        if flagged.is_empty() {
            println!("✅ No requests are past the {}-day SLA", ctx.config.sla.at_risk_after_days);
            return Ok(());
        }
        println!("⏰ AT-RISK REQUESTS");
        println!("==================");
        for item in flagged {
            println!(
                "{}  {:<24} idle {} days, waiting on {}",
                item.request_number,
                item.status.as_str(),
                item.idle_days,
                item.waiting_on.map(|role| role.title()).unwrap_or("nobody")
            );
        }
        Ok(())
    }
}
