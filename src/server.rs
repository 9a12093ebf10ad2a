use crate::config::Config;
use crate::db::poll::PollId;
use crate::error::VoteError;
use crate::routes;
use crate::services::{poll::GetPoll, Services};
use crate::span::SpanMessage;
use crate::websocket::DisplayClient;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use sqlx::types::Uuid;
use tracing::instrument;

#[instrument(skip(req, stream, services, config))]
async fn display_ws(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<Uuid>,
    services: web::Data<Services>,
    config: web::Data<Config>,
) -> Result<HttpResponse, Error> {
    let poll_id = PollId(path.into_inner());
    services
        .polls
        .send(SpanMessage::new(GetPoll(poll_id.clone())))
        .await
        .map_err(VoteError::from)??;
    ws::start(
        DisplayClient::new(
            poll_id,
            services.get_ref().clone(),
            config.get_ref().clone(),
        ),
        &req,
        stream,
    )
}

pub fn configure(cfg: &mut web::ServiceConfig, services: Services, config: Config) {
    cfg.app_data(web::Data::new(services))
        .app_data(web::Data::new(config))
        .service(
            web::resource("/polls")
                .route(web::get().to(routes::list_polls))
                .route(web::post().to(routes::create_poll)),
        )
        .service(
            web::resource("/polls/{poll_id}")
                .route(web::get().to(routes::get_poll))
                .route(web::delete().to(routes::delete_poll)),
        )
        .route("/polls/{poll_id}/close", web::post().to(routes::close_poll))
        .route("/polls/{poll_id}/reopen", web::post().to(routes::reopen_poll))
        .service(
            web::resource("/polls/{poll_id}/votes")
                .route(web::get().to(routes::list_votes))
                .route(web::post().to(routes::cast_vote)),
        )
        .route("/polls/{poll_id}/tokens", web::post().to(routes::issue_token))
        .route(
            "/polls/{poll_id}/tokens/current",
            web::post().to(routes::current_token),
        )
        .route(
            "/polls/{poll_id}/prepare/{token}",
            web::get().to(routes::prepare_vote),
        )
        .route(
            "/polls/{poll_id}/simulate",
            web::post().to(routes::simulate_vote),
        )
        .route("/tokens/{token}", web::get().to(routes::token_status))
        .route("/tokens/{token}/scan", web::post().to(routes::mark_scanned))
        .route("/stats/votes", web::get().to(routes::vote_stats))
        // websocket
        .route("/ws/display/{poll_id}", web::get().to(display_ws));
}
