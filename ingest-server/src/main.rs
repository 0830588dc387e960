#[rocket::launch]
fn rocket() -> _ {
    let rocket = ingest_server::rocket();
    log::info!("starting ingest server");
    rocket
}
